pub mod config;
pub mod error;
pub mod types;

pub use config::AttacheConfig;
pub use error::{AttacheError, AttacheResult};
pub use types::{Destination, Part};
