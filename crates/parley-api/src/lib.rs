pub mod auth;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod receipts;
pub mod render;
pub mod resolver;
pub mod send;
pub mod typing;
pub mod users;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{AppState, AppStateInner};
pub use error::EngineError;
