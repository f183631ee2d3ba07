//! attache-storage: remote object-store contract + OpenDAL backend
//!
//! Everything above this crate talks to an [`ObjectStore`]. Two
//! implementations ship here: [`OpendalStore`] for real backends (S3, fs,
//! memory via OpenDAL) and [`MemoryStore`], an in-process fake with fault
//! injection for tests.

pub mod health;
pub mod memory;
pub mod opendal_store;
pub mod operator;
pub mod store;

pub use health::check_health;
pub use memory::MemoryStore;
pub use opendal_store::OpendalStore;
pub use operator::{build_from_core_config, build_operator, S3Config};
pub use store::{etag_of, MultipartHandle, ObjectStore};
