pub mod connection;
pub mod dispatcher;
pub mod typing;

pub use connection::handle_connection;
pub use dispatcher::{Dispatcher, Notify};
