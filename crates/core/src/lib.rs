//! Core utilities for the vkexp harness.
//!
//! This crate provides the foundational pieces shared by the other crates:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing

mod error;
mod logging;
mod timer;

pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::Timer;
