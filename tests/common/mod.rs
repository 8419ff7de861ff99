//! Shared fixtures for the integration tests: a scriptable render host, a
//! listener that records every callback and cache stores that count or fail.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use image::{Rgba, RgbaImage};
use tokio::sync::Notify;

use page_thumbs::cache::{CacheStore, MemoryCacheStore, ReadEntry, WriteEntry};
use page_thumbs::errors::{
    ListenerError, RenderError, RenderResult, SinkError, StoreError, StoreResult,
};
use page_thumbs::render::{
    DocumentId, HostContainer, LoadEvent, LoadEvents, RenderPool, RenderSurface, SurfaceHost,
    ThumbnailRenderer,
};
use page_thumbs::thumbnails::{ByteSink, CacheKey, ChannelStatus, ThumbnailListener, ThumbnailProtocol};

pub const SCHEME: &str = "page-thumb";

/// Counters shared between a [`FakeHost`] and everything it creates
#[derive(Default)]
pub struct HostCounters {
    pub creations: AtomicUsize,
    pub surfaces: AtomicUsize,
    pub navigations: AtomicUsize,
    pub destroyed: AtomicUsize,
}

/// Render host painting a solid colour and reporting a fixed status
pub struct FakeHost {
    pub counters: Arc<HostCounters>,
    pub status: u16,
    pub fail_creation: bool,
    /// Held navigations wait here before reporting the load
    pub load_gate: Option<Arc<Notify>>,
}

impl FakeHost {
    pub fn new(status: u16) -> Self {
        Self {
            counters: Arc::new(HostCounters::default()),
            status,
            fail_creation: false,
            load_gate: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_creation: true,
            ..Self::new(200)
        }
    }

    pub fn gated(status: u16, gate: Arc<Notify>) -> Self {
        Self {
            load_gate: Some(gate),
            ..Self::new(status)
        }
    }

    pub fn creations(&self) -> usize {
        self.counters.creations.load(Ordering::SeqCst)
    }

    pub fn surfaces(&self) -> usize {
        self.counters.surfaces.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SurfaceHost for FakeHost {
    async fn create_container(&self) -> RenderResult<Arc<dyn HostContainer>> {
        self.counters.creations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if self.fail_creation {
            return Err(RenderError::HostCreation {
                message: "no display available".to_string(),
            });
        }
        Ok(Arc::new(FakeContainer {
            counters: self.counters.clone(),
            status: self.status,
            load_gate: self.load_gate.clone(),
        }))
    }
}

struct FakeContainer {
    counters: Arc<HostCounters>,
    status: u16,
    load_gate: Option<Arc<Notify>>,
}

#[async_trait]
impl HostContainer for FakeContainer {
    async fn create_surface(&self, width: u32, height: u32) -> RenderResult<Box<dyn RenderSurface>> {
        self.counters.surfaces.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSurface {
            counters: self.counters.clone(),
            status: self.status,
            load_gate: self.load_gate.clone(),
            width,
            height,
        }))
    }
}

struct FakeSurface {
    counters: Arc<HostCounters>,
    status: u16,
    load_gate: Option<Arc<Notify>>,
    width: u32,
    height: u32,
}

#[async_trait]
impl RenderSurface for FakeSurface {
    async fn navigate(&mut self, _url: &str) -> RenderResult<LoadEvents> {
        self.counters.navigations.fetch_add(1, Ordering::SeqCst);
        let gate = self.load_gate.clone();
        let status = self.status;
        let load = async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            LoadEvent {
                document: 1,
                status: Some(status),
            }
        };
        Ok(futures::stream::once(load).boxed())
    }

    fn top_document(&self) -> DocumentId {
        1
    }

    async fn paint(&mut self) -> RenderResult<RgbaImage> {
        Ok(RgbaImage::from_pixel(
            self.width,
            self.height,
            Rgba([30, 60, 90, 255]),
        ))
    }

    async fn destroy(self: Box<Self>) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn renderer(host: Arc<FakeHost>) -> Arc<ThumbnailRenderer> {
    renderer_with_deadline(host, Duration::from_secs(5))
}

pub fn renderer_with_deadline(host: Arc<FakeHost>, load_deadline: Duration) -> Arc<ThumbnailRenderer> {
    let pool = Arc::new(RenderPool::new(host, load_deadline));
    Arc::new(ThumbnailRenderer::new(
        pool,
        64,
        [255, 255, 255, 255],
        image::imageops::FilterType::Triangle,
    ))
}

pub fn protocol(store: Arc<dyn CacheStore>, host: Arc<FakeHost>) -> ThumbnailProtocol {
    ThumbnailProtocol::new(SCHEME, store, renderer(host))
}

/// One listener callback as observed by a [`RecordingListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Start,
    Data(Vec<u8>),
    Stop(ChannelStatus),
}

pub type EventLog = Arc<Mutex<Vec<ListenerEvent>>>;

/// Listener appending every callback to a shared log
pub struct RecordingListener {
    events: EventLog,
    reject_data: bool,
}

impl RecordingListener {
    pub fn new() -> (Self, EventLog) {
        let events = EventLog::default();
        (
            Self {
                events: events.clone(),
                reject_data: false,
            },
            events,
        )
    }

    /// A listener whose `on_data` always fails
    pub fn rejecting() -> (Self, EventLog) {
        let (mut listener, events) = Self::new();
        listener.reject_data = true;
        (listener, events)
    }

    fn push(&self, event: ListenerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ThumbnailListener for RecordingListener {
    fn on_start(&mut self) -> Result<(), ListenerError> {
        self.push(ListenerEvent::Start);
        Ok(())
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<(), ListenerError> {
        if self.reject_data {
            return Err(ListenerError::rejected("consumer went away"));
        }
        self.push(ListenerEvent::Data(chunk.to_vec()));
        Ok(())
    }

    fn on_stop(&mut self, status: ChannelStatus) -> Result<(), ListenerError> {
        self.push(ListenerEvent::Stop(status));
        Ok(())
    }
}

pub fn events(log: &EventLog) -> Vec<ListenerEvent> {
    log.lock().unwrap().clone()
}

/// Concatenated `on_data` payloads
pub fn body(log: &EventLog) -> Vec<u8> {
    events(log)
        .into_iter()
        .filter_map(|event| match event {
            ListenerEvent::Data(chunk) => Some(chunk),
            _ => None,
        })
        .flatten()
        .collect()
}

#[derive(Default)]
pub struct StoreCounters {
    /// `read_entry` calls, counted before the lookup resolves
    pub read_calls: AtomicUsize,
    /// `write_entry` calls, counted before the entry is handed out
    pub write_calls: AtomicUsize,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    /// Bytes written to entry outputs
    pub written: AtomicUsize,
    pub commits: AtomicUsize,
    pub closes: AtomicUsize,
}

impl StoreCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Wraps a [`MemoryCacheStore`], counting entry traffic and optionally failing
pub struct CountingStore {
    pub inner: MemoryCacheStore,
    pub counters: Arc<StoreCounters>,
    pub fail_write_entry: bool,
    pub fail_output: bool,
    /// Lookups wait here before resolving
    pub read_gate: Option<Arc<Notify>>,
    /// Write entry allocations wait here before resolving
    pub write_gate: Option<Arc<Notify>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryCacheStore::new(16),
            counters: Arc::new(StoreCounters::default()),
            fail_write_entry: false,
            fail_output: false,
            read_gate: None,
            write_gate: None,
        }
    }

    pub fn read_calls(&self) -> usize {
        StoreCounters::get(&self.counters.read_calls)
    }

    pub fn write_calls(&self) -> usize {
        StoreCounters::get(&self.counters.write_calls)
    }

    pub fn written(&self) -> usize {
        StoreCounters::get(&self.counters.written)
    }

    /// Commit `body` under `key`, bypassing the counters
    pub async fn seed(&self, key: &CacheKey, body: &[u8]) {
        let mut entry = self.inner.write_entry(key).await.unwrap();
        entry.output().write_all(body).unwrap();
        entry.commit().await.unwrap();
    }

    pub fn reads(&self) -> usize {
        StoreCounters::get(&self.counters.reads)
    }

    pub fn writes(&self) -> usize {
        StoreCounters::get(&self.counters.writes)
    }

    pub fn commits(&self) -> usize {
        StoreCounters::get(&self.counters.commits)
    }

    pub fn closes(&self) -> usize {
        StoreCounters::get(&self.counters.closes)
    }
}

#[async_trait]
impl CacheStore for CountingStore {
    async fn read_entry(&self, key: &CacheKey) -> StoreResult<Option<Box<dyn ReadEntry>>> {
        self.counters.read_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.read_gate {
            gate.notified().await;
        }
        let entry = self.inner.read_entry(key).await?;
        Ok(entry.map(|inner| {
            self.counters.reads.fetch_add(1, Ordering::SeqCst);
            Box::new(CountingReadEntry {
                inner,
                counters: self.counters.clone(),
            }) as Box<dyn ReadEntry>
        }))
    }

    async fn write_entry(&self, key: &CacheKey) -> StoreResult<Box<dyn WriteEntry>> {
        self.counters.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.write_gate {
            gate.notified().await;
        }
        if self.fail_write_entry {
            return Err(StoreError::unavailable(key.as_str(), "disk full"));
        }
        let inner = self.inner.write_entry(key).await?;
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingWriteEntry {
            inner,
            counters: self.counters.clone(),
            fail_output: self.fail_output,
            failing_sink: FailingSink,
        }))
    }
}

struct CountingReadEntry {
    inner: Box<dyn ReadEntry>,
    counters: Arc<StoreCounters>,
}

#[async_trait]
impl ReadEntry for CountingReadEntry {
    fn key(&self) -> &CacheKey {
        self.inner.key()
    }

    fn available(&self) -> usize {
        self.inner.available()
    }

    async fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        self.inner.read_all().await
    }

    fn metadata(&self, name: &str) -> Option<String> {
        self.inner.metadata(name)
    }

    async fn close(self: Box<Self>) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}

struct CountingWriteEntry {
    inner: Box<dyn WriteEntry>,
    counters: Arc<StoreCounters>,
    fail_output: bool,
    failing_sink: FailingSink,
}

#[async_trait]
impl WriteEntry for CountingWriteEntry {
    fn key(&self) -> &CacheKey {
        self.inner.key()
    }

    fn output(&mut self) -> &mut dyn ByteSink {
        if self.fail_output {
            &mut self.failing_sink as &mut dyn ByteSink
        } else {
            self as &mut dyn ByteSink
        }
    }

    fn set_metadata(&mut self, name: &str, value: &str) {
        self.inner.set_metadata(name, value);
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit().await
    }

    async fn close(self: Box<Self>) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}

impl ByteSink for CountingWriteEntry {
    fn write_all(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.counters.written.fetch_add(chunk.len(), Ordering::SeqCst);
        self.inner.output().write_all(chunk)
    }
}

struct FailingSink;

impl ByteSink for FailingSink {
    fn write_all(&mut self, _chunk: &[u8]) -> Result<(), SinkError> {
        Err(SinkError::Write {
            message: "device unplugged".to_string(),
        })
    }
}
