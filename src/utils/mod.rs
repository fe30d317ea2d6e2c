//! Shared helpers: filesystem cleanup, URL validation and logging setup

pub mod file_utils;
pub mod logging;
pub mod validation;

pub use file_utils::*;
pub use logging::*;
pub use validation::*;
