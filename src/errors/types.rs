//! Error type definitions for the thumbnail service
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that keeps the pipeline's failure
//! categories (store, render, listener, cancellation) apart.

use std::time::Duration;

use thiserror::Error;

use crate::render::{BAD_GATEWAY, GATEWAY_TIMEOUT};

/// Top-level application error type
///
/// This enum represents every error that can surface outside the pipeline.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Request descriptor errors
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Protocol dispatcher errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Channel lifecycle errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Cache store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Rendering errors
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised while parsing a thumbnail request query
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// The URI carries no query string at all
    #[error("Missing query in thumbnail URI: {uri}")]
    MissingQuery { uri: String },

    /// A mandatory dimension was not supplied
    #[error("Missing required parameter: {name}")]
    MissingParameter { name: &'static str },

    /// A dimension was supplied but is not a positive integer
    #[error("Invalid value for {name}: '{value}'")]
    InvalidDimension { name: &'static str, value: String },
}

/// Errors raised by the protocol dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The URI does not use the thumbnail scheme
    #[error("Unsupported scheme in '{uri}' (expected '{expected}')")]
    UnsupportedScheme { uri: String, expected: String },

    /// The request does not name a page to thumbnail
    #[error("Thumbnail request has no target URL: {uri}")]
    MissingTarget { uri: String },

    /// The query could not be parsed
    #[error("Invalid thumbnail request: {0}")]
    InvalidRequest(#[from] DescriptorError),
}

/// Errors raised by misuse of the channel lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// `open` was called a second time
    #[error("Channel already opened: {uri}")]
    AlreadyOpened { uri: String },
}

/// Cache store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O failures of a persistent store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry metadata could not be (de)serialized
    #[error("Metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The store refused to hand out an entry
    #[error("Cache entry unavailable for key '{key}': {message}")]
    Unavailable { key: String, message: String },

    /// The entry was already released
    #[error("Cache entry closed: {key}")]
    Closed { key: String },
}

/// Rendering pipeline errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// The off-screen host container could not be created
    #[error("Host container creation failed: {message}")]
    HostCreation { message: String },

    /// A render surface could not be created inside the host
    #[error("Surface creation failed: {message}")]
    SurfaceCreation { message: String },

    /// The surface could not start loading the page
    #[error("Navigation to '{url}' failed: {message}")]
    Navigation { url: String, message: String },

    /// The surface stopped reporting load events before the top document loaded
    #[error("Load of '{url}' was interrupted")]
    LoadInterrupted { url: String },

    /// The top document did not finish loading in time
    #[error("Load of '{url}' timed out after {timeout:?}")]
    LoadTimeout { url: String, timeout: Duration },

    /// The surface could not be painted to a bitmap
    #[error("Painting '{url}' failed: {message}")]
    Paint { url: String, message: String },

    /// The scaled bitmap could not be encoded
    #[error("Encoding thumbnail failed: {0}")]
    Encode(#[from] image::ImageError),

    /// The encoding task was dropped or panicked
    #[error("Encoding task failed: {message}")]
    EncodeTask { message: String },

    /// Requested output size is unusable
    #[error("Invalid thumbnail size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// Errors raised by a byte sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink was closed or released before the write
    #[error("Sink closed")]
    Closed,

    /// The sink rejected the bytes
    #[error("Sink write failed: {message}")]
    Write { message: String },

    /// The sink reached its configured size limit
    #[error("Sink limit of {limit} bytes exceeded")]
    LimitExceeded { limit: usize },

    /// The channel listener refused the bytes
    #[error("Listener failed: {0}")]
    Listener(#[from] ListenerError),
}

/// Errors a listener reports from its callbacks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The consumer went away
    #[error("Listener disconnected")]
    Disconnected,

    /// The consumer rejected the callback
    #[error("Listener rejected callback: {message}")]
    Rejected { message: String },
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl StoreError {
    /// Create an unavailable-entry error
    pub fn unavailable<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Unavailable {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl RenderError {
    /// Gateway status for a page whose load failed after navigation started.
    ///
    /// Such pages are still painted; other failures leave no bitmap and
    /// return `None`.
    pub fn load_failure_status(&self) -> Option<u16> {
        match self {
            Self::LoadTimeout { .. } => Some(GATEWAY_TIMEOUT),
            Self::LoadInterrupted { .. } => Some(BAD_GATEWAY),
            _ => None,
        }
    }
}

impl ListenerError {
    /// Create a rejected-callback error
    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}
