//! Listener side of a thumbnail channel
//!
//! A channel reports its progress through three callbacks: `on_start` once,
//! `on_data` any number of times and `on_stop` at most once, always in that
//! order. After the channel is canceled none of them fire again.

use tokio::sync::oneshot;

use crate::errors::ListenerError;

/// Terminal status of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    /// The request ran to completion with an HTTP-like status code
    Completed(u16),
    /// The request was aborted, typically because the listener gave up
    Aborted,
    /// The pipeline failed (store allocation, rendering or encoding)
    Unexpected,
}

impl ChannelStatus {
    /// Completed with a 2xx status
    pub fn is_success(&self) -> bool {
        matches!(self, ChannelStatus::Completed(code) if code / 100 == 2)
    }

    /// HTTP status code a front door should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            ChannelStatus::Completed(code) => *code,
            ChannelStatus::Aborted => 503,
            ChannelStatus::Unexpected => 500,
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Completed(code) => write!(f, "completed({code})"),
            ChannelStatus::Aborted => f.write_str("aborted"),
            ChannelStatus::Unexpected => f.write_str("unexpected"),
        }
    }
}

/// Consumer of a thumbnail channel.
///
/// Returning an error from `on_start` or `on_data` aborts the channel. Errors
/// from `on_stop` are logged and otherwise ignored.
pub trait ThumbnailListener: Send {
    fn on_start(&mut self) -> Result<(), ListenerError>;

    fn on_data(&mut self, chunk: &[u8]) -> Result<(), ListenerError>;

    fn on_stop(&mut self, status: ChannelStatus) -> Result<(), ListenerError>;
}

/// Outcome gathered by a [`CollectingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedThumbnail {
    pub status: ChannelStatus,
    pub body: Vec<u8>,
    pub started: bool,
}

/// Listener buffering the whole response and handing it over on stop.
///
/// The receiver resolves with an error when the channel is canceled, since a
/// canceled channel never calls `on_stop`.
pub struct CollectingListener {
    body: Vec<u8>,
    started: bool,
    max_bytes: Option<usize>,
    sender: Option<oneshot::Sender<CollectedThumbnail>>,
}

impl CollectingListener {
    pub fn new() -> (Self, oneshot::Receiver<CollectedThumbnail>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                body: Vec::new(),
                started: false,
                max_bytes: None,
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Abort the channel once more than `max_bytes` would be buffered
    pub fn with_limit(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

impl ThumbnailListener for CollectingListener {
    fn on_start(&mut self) -> Result<(), ListenerError> {
        if self.sender.as_ref().is_some_and(|s| s.is_closed()) {
            return Err(ListenerError::Disconnected);
        }
        self.started = true;
        Ok(())
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<(), ListenerError> {
        if let Some(limit) = self.max_bytes
            && self.body.len() + chunk.len() > limit
        {
            return Err(ListenerError::rejected(format!(
                "response exceeds {limit} bytes"
            )));
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn on_stop(&mut self, status: ChannelStatus) -> Result<(), ListenerError> {
        let sender = self.sender.take().ok_or(ListenerError::Disconnected)?;
        sender
            .send(CollectedThumbnail {
                status,
                body: std::mem::take(&mut self.body),
                started: self.started,
            })
            .map_err(|_| ListenerError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(ChannelStatus::Completed(200).is_success());
        assert!(ChannelStatus::Completed(204).is_success());
        assert!(!ChannelStatus::Completed(404).is_success());
        assert!(!ChannelStatus::Aborted.is_success());
        assert_eq!(ChannelStatus::Completed(404).http_status(), 404);
        assert_eq!(ChannelStatus::Aborted.http_status(), 503);
        assert_eq!(ChannelStatus::Unexpected.http_status(), 500);
    }

    #[tokio::test]
    async fn test_collecting_listener_delivers_on_stop() {
        let (mut listener, receiver) = CollectingListener::new();
        listener.on_start().unwrap();
        listener.on_data(b"abc").unwrap();
        listener.on_data(b"def").unwrap();
        listener.on_stop(ChannelStatus::Completed(200)).unwrap();

        let collected = receiver.await.unwrap();
        assert_eq!(collected.body, b"abcdef");
        assert_eq!(collected.status, ChannelStatus::Completed(200));
        assert!(collected.started);
    }

    #[tokio::test]
    async fn test_collecting_listener_without_stop_closes_receiver() {
        let (listener, receiver) = CollectingListener::new();
        drop(listener);
        assert!(receiver.await.is_err());
    }

    #[test]
    fn test_collecting_listener_limit() {
        let (listener, _receiver) = CollectingListener::new();
        let mut listener = listener.with_limit(4);
        listener.on_data(b"abc").unwrap();
        assert!(listener.on_data(b"de").is_err());
    }

    #[test]
    fn test_collecting_listener_detects_dropped_receiver() {
        let (mut listener, receiver) = CollectingListener::new();
        drop(receiver);
        assert_eq!(listener.on_start(), Err(ListenerError::Disconnected));
    }
}
