pub mod config;
pub mod deliver;
pub mod error;
pub mod queue;
pub mod transport;

pub use config::QueueConfig;
pub use deliver::Deliver;
pub use error::{DeliveryError, TransportError};
pub use queue::{AttemptOutcome, QueueEvent, QueueStats, TaskQueue};
pub use transport::{Message, MockTransport, Transport};
pub use transport::smtp::{SmtpConfig, SmtpTransport};
