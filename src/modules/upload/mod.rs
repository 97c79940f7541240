pub mod manager;
pub mod models;
pub mod validate;


pub use manager::UploadManager;
pub use models::{ChunkInfo, UploadSource, UploadStatus, UploadTask};
