//! Lynx Common Library
//!
//! Shared configuration, logging bootstrap, and error types used by the
//! Lynx market-data and screening services.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::logging::init_logging;
}
