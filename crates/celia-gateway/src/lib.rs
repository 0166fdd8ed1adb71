pub mod handler;
pub mod router;
pub mod server;
pub mod state;

pub use server::MessageGateway;
pub use state::{AppState, SessionState, SharedState};
