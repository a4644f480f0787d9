//! Utility modules and helper functions
//!
//! This module contains shared utilities used across the engine.

pub mod file_utils;
pub mod logging;

// Re-export commonly used utilities
pub use file_utils::*;
pub use logging::*;
