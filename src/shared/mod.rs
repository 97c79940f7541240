pub mod config;
pub mod error;
pub mod events;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
