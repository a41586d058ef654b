//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Address: network address representation
//! - Timestamp: request time windows and their wire form
//! - Error, Result: re-exported from `crate::error`

mod address;
mod stream;
pub mod time;

pub use address::Address;
pub use stream::{IntoStream, Stream};
pub use time::Timestamp;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
