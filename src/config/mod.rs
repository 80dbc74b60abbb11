//! Configuration & shared vocabulary: resource kinds, error types, exit
//! codes, and the grant-file parser.

pub mod limits;
pub mod types;

pub use limits::ResourceLimits;
pub use types::{Result, SandboxError};
