pub mod registry;
#[cfg(feature = "telegram")]
pub mod telegram;
pub mod traits;

pub use registry::ConnectorRegistry;
#[cfg(feature = "telegram")]
pub use telegram::TelegramConnector;
pub use traits::{Connector, ConnectorStatus, OnMessageFn};
