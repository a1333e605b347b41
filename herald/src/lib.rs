pub mod config;
pub mod controller;
pub mod csv_source;
pub mod events;
pub mod state;

pub use config::{HeraldConfig, MessageConfig};
pub use controller::{Controller, ControllerError, MessageOptions};
pub use events::Event;
pub use state::ControllerState;
