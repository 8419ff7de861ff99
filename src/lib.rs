//! On-demand web page thumbnails.
//!
//! Requests arrive as `page-thumb://thumbnail?...` URIs. The
//! [`thumbnails::ThumbnailProtocol`] turns each into a channel that streams
//! a cached PNG when one exists and otherwise renders the page through the
//! shared [`render::RenderPool`], teeing the encoded bytes into the cache
//! while they are delivered.

pub mod cache;
pub mod config;
pub mod errors;
pub mod observability;
pub mod render;
pub mod thumbnails;
pub mod web;
