//! Thumbnail request pipeline
//!
//! Requests arrive as thumbnail URIs at the [`ThumbnailProtocol`] dispatcher,
//! which parses them into a [`RequestDescriptor`], derives a [`CacheKey`] and
//! hands out a [`Channel`]. A channel serves cached bytes when it can and
//! otherwise renders the page, teeing the encoded PNG to its listener and to
//! the cache.

pub mod cache_key;
pub mod channel;
pub mod descriptor;
pub mod listener;
pub mod protocol;
pub mod tee;

pub use cache_key::CacheKey;
pub use channel::{CancelOnDrop, Channel, ChannelMode, ChannelPhase};
pub use descriptor::RequestDescriptor;
pub use listener::{ChannelStatus, CollectedThumbnail, CollectingListener, ThumbnailListener};
pub use protocol::{Dispatch, StaticResponse, ThumbnailProtocol};
pub use tee::{ByteSink, TeeReport, TeeWriter};

/// Content type of every thumbnail response
pub const CONTENT_TYPE: &str = "image/png";

/// Target URL answered with a static placeholder instead of a render
pub const BLANK_PAGE: &str = "about:blank";
