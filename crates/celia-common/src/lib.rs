pub mod error;
pub mod message;
pub mod secret;
pub mod types;

pub use error::{Error, Result};
pub use message::{InboundMessage, LinkButton, OutboundMessage};
pub use secret::mask_secret;
pub use types::{ChannelId, SessionId, UserId};
