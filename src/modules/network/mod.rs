pub mod monitor;

pub use monitor::{ConnectionQuality, NetworkMonitor};
