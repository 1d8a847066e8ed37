use std::process::ExitCode;

fn main() -> ExitCode {
    agenthost_cli::run()
}
