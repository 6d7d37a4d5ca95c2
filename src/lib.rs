pub mod cmd;
pub mod dumper;
pub mod error;
pub mod inspect;
pub mod job;
pub mod joblog;
pub mod layout;
pub mod payload;
pub mod pipeline;
pub mod record;
pub mod remote;
pub mod unzip;
pub mod version;

// Re-export the types most callers need
pub use crate::error::{Error, Result};
pub use crate::pipeline::{Pipeline, PipelineConfig, Summary};
