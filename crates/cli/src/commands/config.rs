use serde_json::json;

use agenthost_core::config::{resolve_config_path, LoadOptions, RuntimeConfig};

use crate::commands::{escape_json, CommandResult, CONFIG_FAILURE_EXIT_CODE};

/// Effective configuration (defaults < manifest < environment) with every
/// secret replaced by `***`.
pub fn run(options: LoadOptions) -> CommandResult {
    let manifest = resolve_config_path(options.config_path.as_deref());

    let config = match RuntimeConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("configuration issue: {error}"),
                CONFIG_FAILURE_EXIT_CODE,
            );
        }
    };

    let payload = json!({
        "manifest": manifest.map(|path| path.display().to_string()),
        "config": config.redacted(),
    });

    let output = serde_json::to_string_pretty(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"config\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            escape_json(&error.to_string())
        )
    });

    CommandResult { exit_code: 0, output }
}
