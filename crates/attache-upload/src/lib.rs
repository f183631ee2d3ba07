//! attache-upload: resumable multipart upload of sealed attachments, the
//! durable upload stash behind it, and seekable decryption of stored objects.

pub mod descriptor;
pub mod error;
pub mod limiter;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod source;
pub mod stash;

pub use descriptor::ObjectDescriptor;
pub use error::{ReaderError, StashError, UploadError};
pub use limiter::UploadLimiter;
pub use pipeline::{KeyObserver, UploadOutcome, UploadTask, Uploader, UploaderConfig};
pub use progress::{ProgressFn, ThrottledProgress};
pub use reader::RandomAccessReader;
pub use source::{BytesSource, FileSource, PlaintextSource};
pub use stash::{open_stash, AttachmentInfo, AttachmentStash, FileStash, MemoryStash, StashKey};

#[cfg(feature = "rocksdb")]
pub use stash::RocksDbStash;
