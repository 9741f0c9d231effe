pub mod admin;
pub mod config;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod runner;
pub mod transform;
pub mod types;

pub use admin::EtlAdmin;
pub use config::Config;
pub use error::{EtlError, Result};
