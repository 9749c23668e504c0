pub mod delivery;
pub mod email;
pub mod providers;
pub mod sendgrid;
pub mod templates;
pub mod twilio;

pub use delivery::{DeliveryError, MessageDeliveryService, SendRequest};
pub use providers::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt, ProviderRegistry};
