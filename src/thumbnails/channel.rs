//! Per-request thumbnail channel
//!
//! A channel moves through `Created -> Opened -> {ServingFromCache |
//! Generating} -> Stopped`, and can be canceled from any state before
//! `Stopped`. Opening spawns the work on a tokio task and returns at once;
//! progress is reported only through the listener callbacks.
//!
//! The canceled flag is re-checked after every suspension point (cache
//! lookup, write entry allocation, render). Once it is set no callback fires
//! and any cache entry obtained afterwards is closed untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::listener::{ChannelStatus, ThumbnailListener};
use super::tee::{ByteSink, TeeWriter};
use super::{CONTENT_TYPE, CacheKey, RequestDescriptor};
use crate::cache::{CONTENT_LENGTH_METADATA, CacheStore};
use crate::errors::{ChannelError, SinkError};
use crate::observability::{RequestOutcome, ThumbnailMetrics};
use crate::render::ThumbnailRenderer;

/// Status served by a cache-only channel that finds nothing
pub const NOT_FOUND_STATUS: u16 = 404;

const CONTENT_TYPE_HEADER: &str = "content-type";
const CONTENT_LENGTH_HEADER: &str = "content-length";

/// Lifecycle position of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Created,
    Opened,
    ServingFromCache,
    Generating,
    Stopped,
    Canceled,
}

/// Whether a channel may render on a cache miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Serve from the cache, rendering and caching on a miss
    Generate,
    /// Serve from the cache only; a miss completes with 404
    CacheOnly,
}

struct ChannelState {
    phase: ChannelPhase,
    status: Option<ChannelStatus>,
    started: bool,
    response_status: u16,
    headers: BTreeMap<String, String>,
}

struct ChannelInner {
    request_id: Uuid,
    uri: String,
    descriptor: RequestDescriptor,
    cache_key: CacheKey,
    mode: ChannelMode,
    store: Arc<dyn CacheStore>,
    renderer: Arc<ThumbnailRenderer>,
    chunk_size: usize,
    metrics: ThumbnailMetrics,
    opened: AtomicBool,
    canceled: AtomicBool,
    state: Mutex<ChannelState>,
    listener: Mutex<Option<Box<dyn ThumbnailListener>>>,
    /// Held for the duration of every listener callback
    delivery: Mutex<()>,
    /// Thread currently inside a listener callback
    delivering: Mutex<Option<ThreadId>>,
    done: watch::Sender<bool>,
}

/// Handle to one thumbnail request
///
/// Cloning the handle does not clone the request: all clones observe and
/// control the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        uri: String,
        descriptor: RequestDescriptor,
        mode: ChannelMode,
        store: Arc<dyn CacheStore>,
        renderer: Arc<ThumbnailRenderer>,
        chunk_size: usize,
        metrics: ThumbnailMetrics,
    ) -> Self {
        let cache_key = CacheKey::build(&descriptor);
        let mut headers = BTreeMap::new();
        headers.insert(CONTENT_TYPE_HEADER.to_string(), CONTENT_TYPE.to_string());
        let (done, _) = watch::channel(false);

        Self {
            inner: Arc::new(ChannelInner {
                request_id: Uuid::new_v4(),
                uri,
                descriptor,
                cache_key,
                mode,
                store,
                renderer,
                chunk_size: chunk_size.max(1),
                metrics,
                opened: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                state: Mutex::new(ChannelState {
                    phase: ChannelPhase::Created,
                    status: None,
                    started: false,
                    response_status: 200,
                    headers,
                }),
                listener: Mutex::new(None),
                delivery: Mutex::new(()),
                delivering: Mutex::new(None),
                done,
            }),
        }
    }

    /// Start the request, reporting to `listener`.
    ///
    /// Returns immediately; the work runs on a spawned task. A channel that
    /// was canceled before opening accepts the call but never invokes the
    /// listener.
    pub fn open<L>(&self, listener: L) -> Result<(), ChannelError>
    where
        L: ThumbnailListener + 'static,
    {
        let inner = &self.inner;
        if inner.opened.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::AlreadyOpened {
                uri: inner.uri.clone(),
            });
        }

        if inner.is_canceled() {
            debug!(
                "[{}] Channel for {} canceled before open",
                inner.request_id, inner.uri
            );
            inner.done.send_replace(true);
            return Ok(());
        }

        *inner.listener_slot() = Some(Box::new(listener));
        {
            let mut state = inner.state();
            if state.phase == ChannelPhase::Canceled {
                drop(state);
                let released = inner.listener_slot().take();
                drop(released);
                inner.done.send_replace(true);
                return Ok(());
            }
            state.phase = ChannelPhase::Opened;
        }
        trace!("[{}] Opened channel for {}", inner.request_id, inner.uri);

        let task = inner.clone();
        tokio::spawn(async move {
            task.run().await;
            task.done.send_replace(true);
        });
        Ok(())
    }

    /// Cancel the request with `status`.
    ///
    /// No listener callback fires after this returns: a callback running on
    /// another thread is waited for. Called from inside a callback, it returns
    /// at once and that callback is the last one. Has no effect once the
    /// channel has stopped.
    pub fn cancel(&self, status: ChannelStatus) {
        self.inner.cancel(status);
    }

    /// Wait until the channel's task has finished all of its work, including
    /// closing cache entries. Returns at once if the channel was canceled
    /// before opening; never returns for a channel that is never opened.
    pub async fn finished(&self) {
        let mut receiver = self.inner.done.subscribe();
        let _ = receiver.wait_for(|done| *done).await;
    }

    pub fn request_id(&self) -> Uuid {
        self.inner.request_id
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.inner.descriptor
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.inner.cache_key
    }

    pub fn mode(&self) -> ChannelMode {
        self.inner.mode
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    pub fn phase(&self) -> ChannelPhase {
        self.inner.state().phase
    }

    /// Opened and neither stopped nor canceled
    pub fn is_pending(&self) -> bool {
        matches!(
            self.phase(),
            ChannelPhase::Opened | ChannelPhase::ServingFromCache | ChannelPhase::Generating
        )
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Terminal status, once the channel stopped or was canceled
    pub fn status(&self) -> Option<ChannelStatus> {
        self.inner.state().status
    }

    /// HTTP-like status of the response
    pub fn response_status(&self) -> u16 {
        self.inner.state().response_status
    }

    /// Case-insensitive response header lookup
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.inner
            .state()
            .headers
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Set a response header; an empty value removes it
    pub fn set_response_header(&self, name: &str, value: &str) {
        self.inner.set_header(name, value);
    }

    /// Snapshot of all response headers with lower-cased names
    pub fn response_headers(&self) -> Vec<(String, String)> {
        self.inner
            .state()
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("request_id", &self.inner.request_id)
            .field("uri", &self.inner.uri)
            .field("mode", &self.inner.mode)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Cancels the channel with `Aborted` when dropped unless disarmed.
///
/// Front doors hold one while awaiting a response, so a client that goes
/// away stops the channel from delivering further callbacks.
pub struct CancelOnDrop {
    channel: Option<Channel>,
}

impl CancelOnDrop {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    /// Let the channel run on after the guard is dropped
    pub fn disarm(mut self) {
        self.channel = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take()
            && channel.is_pending()
        {
            debug!(
                "[{}] Request for {} dropped, canceling channel",
                channel.request_id(),
                channel.uri()
            );
            channel.cancel(ChannelStatus::Aborted);
        }
    }
}

/// Feeds the listener through the channel so cancellation is honoured per chunk
struct ListenerSink<'a> {
    channel: &'a ChannelInner,
}

impl ByteSink for ListenerSink<'_> {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        match self.channel.with_listener(|listener| listener.on_data(chunk)) {
            None => Err(SinkError::Closed),
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                warn!(
                    "[{}] Listener rejected data for {}: {}",
                    self.channel.request_id, self.channel.uri, e
                );
                self.channel.cancel(ChannelStatus::Aborted);
                Err(SinkError::Listener(e))
            }
        }
    }
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<Box<dyn ThumbnailListener>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery_lock(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivering_thread(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.delivering.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Invoke `call` with the delivering thread recorded; the delivery lock
    /// must be held
    fn deliver<R>(
        &self,
        listener: &mut dyn ThumbnailListener,
        call: impl FnOnce(&mut dyn ThumbnailListener) -> R,
    ) -> R {
        *self.delivering_thread() = Some(thread::current().id());
        let result = call(listener);
        *self.delivering_thread() = None;
        result
    }

    fn set_header(&self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let mut state = self.state();
        if value.is_empty() {
            state.headers.remove(&name);
        } else {
            state.headers.insert(name, value.to_string());
        }
    }

    fn cancel(&self, status: ChannelStatus) {
        {
            let mut state = self.state();
            if matches!(state.phase, ChannelPhase::Stopped | ChannelPhase::Canceled) {
                return;
            }
            state.phase = ChannelPhase::Canceled;
            state.status = Some(status);
            self.canceled.store(true, Ordering::SeqCst);
        }
        let reentrant = *self.delivering_thread() == Some(thread::current().id());
        if !reentrant {
            // Wait out a callback in flight on another thread
            drop(self.delivery_lock());
        }
        let released = self.listener_slot().take();
        drop(released);
        debug!(
            "[{}] Canceled channel for {} ({})",
            self.request_id, self.uri, status
        );
    }

    /// Run one callback against the listener unless the channel is canceled.
    ///
    /// The canceled flag is checked under the delivery lock, which `cancel`
    /// waits on. The listener is taken out of its slot for the duration of
    /// the call so that a listener canceling the channel from inside a
    /// callback does not deadlock. It is only put back if the channel is
    /// still live afterwards.
    fn with_listener<R>(&self, call: impl FnOnce(&mut dyn ThumbnailListener) -> R) -> Option<R> {
        let _delivery = self.delivery_lock();
        if self.is_canceled() {
            return None;
        }
        let mut listener = self.listener_slot().take()?;
        let result = self.deliver(listener.as_mut(), call);
        if !self.is_canceled() {
            *self.listener_slot() = Some(listener);
        }
        Some(result)
    }

    /// Deliver `on_start` once; false when the channel can no longer proceed
    fn deliver_start(&self) -> bool {
        if self.state().started {
            return !self.is_canceled();
        }
        match self.with_listener(|listener| listener.on_start()) {
            None => false,
            Some(Ok(())) => {
                self.state().started = true;
                true
            }
            Some(Err(e)) => {
                warn!(
                    "[{}] Listener rejected start of {}: {}",
                    self.request_id, self.uri, e
                );
                self.cancel(ChannelStatus::Aborted);
                false
            }
        }
    }

    /// Deliver `on_stop` exactly once and release the listener
    fn stop(&self, status: ChannelStatus) {
        let _delivery = self.delivery_lock();
        {
            let mut state = self.state();
            if self.is_canceled() || state.phase == ChannelPhase::Stopped {
                return;
            }
            state.phase = ChannelPhase::Stopped;
            state.status = Some(status);
        }

        let listener = self.listener_slot().take();
        if let Some(mut listener) = listener
            && let Err(e) = self.deliver(listener.as_mut(), |listener| listener.on_stop(status))
        {
            debug!(
                "[{}] Ignoring listener error on stop of {}: {}",
                self.request_id, self.uri, e
            );
        }
    }

    /// Report a pipeline failure: start if not yet started, then stop
    fn fail(&self, status: ChannelStatus) {
        if self.deliver_start() {
            self.stop(status);
        }
        self.metrics.record_request(RequestOutcome::Failed);
    }

    fn note_canceled(&self) {
        trace!(
            "[{}] Channel for {} observed cancellation",
            self.request_id, self.uri
        );
        self.metrics.record_request(RequestOutcome::Canceled);
    }

    async fn run(&self) {
        let use_cache = self.mode == ChannelMode::CacheOnly || !self.descriptor.force_refresh();
        if use_cache {
            if self.serve_from_cache().await {
                return;
            }
            if self.is_canceled() {
                self.note_canceled();
                return;
            }
        } else {
            debug!(
                "[{}] Forced refresh of {}, skipping cache lookup",
                self.request_id, self.descriptor
            );
        }

        match self.mode {
            ChannelMode::CacheOnly => self.serve_not_found(),
            ChannelMode::Generate => self.generate().await,
        }
    }

    /// Try to answer from the cache; true when the request was handled
    async fn serve_from_cache(&self) -> bool {
        let entry = match self.store.read_entry(&self.cache_key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    "[{}] Cache lookup for {} failed, treating as miss: {}",
                    self.request_id, self.cache_key, e
                );
                None
            }
        };

        if self.is_canceled() {
            if let Some(entry) = entry {
                entry.close().await;
            }
            self.note_canceled();
            return true;
        }

        let Some(mut entry) = entry else {
            trace!("[{}] Cache miss for {}", self.request_id, self.cache_key);
            return false;
        };
        if entry.available() == 0 {
            trace!(
                "[{}] Ignoring empty cache entry for {}",
                self.request_id, self.cache_key
            );
            entry.close().await;
            return false;
        }

        self.state().phase = ChannelPhase::ServingFromCache;
        let body = match entry.read_all().await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "[{}] Failed to read cached thumbnail for {}: {}",
                    self.request_id, self.cache_key, e
                );
                entry.close().await;
                return self.fall_back_from_cache();
            }
        };

        if self.is_canceled() {
            entry.close().await;
            self.note_canceled();
            return true;
        }
        if body.is_empty() {
            entry.close().await;
            return self.fall_back_from_cache();
        }

        self.set_header(CONTENT_LENGTH_HEADER, &body.len().to_string());

        debug!(
            "[{}] Serving {} cached bytes for {}",
            self.request_id,
            body.len(),
            self.descriptor
        );
        if self.stream_to_listener(&body) {
            self.state().response_status = 200;
            self.stop(ChannelStatus::Completed(200));
            self.metrics.record_request(RequestOutcome::CacheHit);
        } else {
            self.note_canceled();
        }
        entry.close().await;
        true
    }

    /// Leave the cache path after an unreadable entry; true when canceled meanwhile
    fn fall_back_from_cache(&self) -> bool {
        if self.is_canceled() {
            self.note_canceled();
            return true;
        }
        self.state().phase = ChannelPhase::Opened;
        false
    }

    fn serve_not_found(&self) {
        debug!(
            "[{}] No cached thumbnail for {}, answering {}",
            self.request_id, self.descriptor, NOT_FOUND_STATUS
        );
        self.state().response_status = NOT_FOUND_STATUS;
        if self.deliver_start() {
            self.stop(ChannelStatus::Completed(NOT_FOUND_STATUS));
        }
    }

    /// `on_start` followed by the body in chunks; false if the channel was canceled
    fn stream_to_listener(&self, body: &[u8]) -> bool {
        if !self.deliver_start() {
            return false;
        }
        let mut sink = ListenerSink { channel: self };
        body.chunks(self.chunk_size)
            .all(|chunk| sink.write_all(chunk).is_ok())
    }

    async fn generate(&self) {
        self.state().phase = ChannelPhase::Generating;

        let entry = match self.store.write_entry(&self.cache_key).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(
                    "[{}] Failed to open cache entry for {}: {}",
                    self.request_id, self.cache_key, e
                );
                None
            }
        };

        if self.is_canceled() {
            if let Some(entry) = entry {
                entry.close().await;
            }
            self.note_canceled();
            return;
        }
        let Some(mut entry) = entry else {
            self.fail(ChannelStatus::Unexpected);
            return;
        };

        let descriptor = &self.descriptor;
        let result = self
            .renderer
            .create_thumbnail(
                descriptor.target_url(),
                descriptor.width(),
                descriptor.height(),
            )
            .await;

        if self.is_canceled() {
            entry.close().await;
            self.note_canceled();
            return;
        }

        let thumbnail = match result {
            Ok(thumbnail) if !thumbnail.bytes.is_empty() => thumbnail,
            Ok(_) => {
                warn!(
                    "[{}] Renderer produced no bytes for {}",
                    self.request_id, descriptor
                );
                entry.close().await;
                self.fail(ChannelStatus::Unexpected);
                return;
            }
            Err(e) => {
                warn!(
                    "[{}] Failed to render thumbnail for {}: {}",
                    self.request_id, descriptor, e
                );
                entry.close().await;
                self.fail(ChannelStatus::Unexpected);
                return;
            }
        };

        let status = thumbnail.status;
        let bytes = thumbnail.bytes;
        {
            let mut state = self.state();
            state.response_status = status;
            state
                .headers
                .insert(CONTENT_LENGTH_HEADER.to_string(), bytes.len().to_string());
        }

        if !self.deliver_start() {
            entry.close().await;
            self.note_canceled();
            return;
        }

        if status / 100 != 2 {
            debug!(
                "[{}] Not caching {} response for {}",
                self.request_id, status, descriptor
            );
            entry.close().await;
            if self.stream_to_listener(&bytes) {
                self.stop(ChannelStatus::Completed(status));
                self.metrics.record_request(RequestOutcome::Rendered);
            } else {
                self.note_canceled();
            }
            return;
        }

        entry.set_metadata(CONTENT_LENGTH_METADATA, &bytes.len().to_string());
        let report = {
            let mut listener = ListenerSink { channel: self };
            let mut writer = TeeWriter::new(&mut listener, entry.output());
            for chunk in bytes.chunks(self.chunk_size) {
                if !writer.write(chunk).primary_ok() {
                    break;
                }
            }
            writer.into_parts().2
        };

        if self.is_canceled() {
            entry.close().await;
            self.note_canceled();
            return;
        }

        if let Some(e) = &report.secondary_error {
            warn!(
                "[{}] Cache write for {} failed, discarding entry: {}",
                self.request_id, self.cache_key, e
            );
            self.metrics.record_cache_write_failure();
            entry.close().await;
        } else {
            match entry.commit().await {
                Ok(()) => {
                    info!(
                        "[{}] Cached {} byte thumbnail for {}",
                        self.request_id,
                        bytes.len(),
                        descriptor
                    );
                    self.metrics.record_cache_commit(bytes.len());
                }
                Err(e) => {
                    warn!(
                        "[{}] Failed to commit thumbnail for {}: {}",
                        self.request_id, self.cache_key, e
                    );
                    self.metrics.record_cache_write_failure();
                }
            }
        }

        self.stop(ChannelStatus::Completed(status));
        self.metrics.record_request(RequestOutcome::Rendered);
    }
}
