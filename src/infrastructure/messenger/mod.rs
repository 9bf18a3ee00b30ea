pub mod logging;
pub mod webhook;

pub use logging::LoggingMessenger;
pub use webhook::WebhookMessenger;
