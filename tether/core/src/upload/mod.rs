//! Durable attachment uploads

mod http;
mod item;
mod queue;

pub use http::{HttpUploader, CHECKSUM_HEADER, FILE_NAME_HEADER};
pub use item::{crc32_file, NewUpload, QueuedUploadItem, UploadStatus};
pub use queue::{QueueChange, UploadConfig, UploadQueue, UploadReceipt, Uploader, UPLOADS_KEY};
