//! Centralized error handling for the thumbnail service
//!
//! This module provides the error types used by every layer of the thumbnail
//! pipeline. Most of them never reach the caller of a channel: they are
//! resolved inside the pipeline into a stop status delivered to the listener.
//!
//! # Error Categories
//!
//! - **Descriptor Errors**: malformed thumbnail request queries
//! - **Protocol Errors**: requests the dispatcher refuses to turn into a channel
//! - **Channel Errors**: misuse of the channel lifecycle (e.g. opening twice)
//! - **Store Errors**: cache store lookup, allocation and I/O failures
//! - **Render Errors**: host creation, page load, painting and encoding failures
//! - **Sink/Listener Errors**: consumers refusing bytes or callbacks
//!
//! # Usage
//!
//! ```rust
//! use page_thumbs::errors::{AppError, AppResult};
//!
//! async fn example_function() -> AppResult<String> {
//!     Ok("success".to_string())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for cache store Results
pub type StoreResult<T> = Result<T, StoreError>;

/// Convenience type alias for render Results
pub type RenderResult<T> = Result<T, RenderError>;
