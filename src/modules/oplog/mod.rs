pub mod log;
pub mod models;

#[cfg(test)]
mod tests;

pub use log::OperationLog;
pub use models::{OperationKind, OperationRecord, OperationStatus};
