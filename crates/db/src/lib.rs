pub mod backend;
pub mod file;
pub mod memory;
pub mod migrations;
pub mod sqlite;
pub mod store;

pub use backend::{SessionBackend, StoreError};
pub use file::JsonFileBackend;
pub use memory::InMemorySessionBackend;
pub use sqlite::{connect, DbPool, SqliteSessionBackend};
pub use store::{open_backend, SessionLease, SessionStore};
