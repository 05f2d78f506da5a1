//! SQLite participant store and the HTTP/WebSocket front door for the hunt.

mod persistence;
mod server;

pub use persistence::SqliteParticipantStore;
pub use server::{default_sqlite_path, serve, ServerConfig, ServerError};
