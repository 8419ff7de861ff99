//! Shared host container for render jobs
//!
//! The host container is created lazily by the first job. Jobs that arrive
//! while creation is in flight queue behind it and all receive the same
//! container once it is ready. Creation runs on its own task so a caller that
//! goes away cannot leave the queue waiting forever.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, trace, warn};

use super::{
    DEFAULT_LOAD_STATUS, HostContainer, RenderJob, RenderSurface, RenderedPage, SurfaceHost,
};
use crate::errors::{RenderError, RenderResult};
use crate::observability::ThumbnailMetrics;

type ContainerReply = Result<Arc<dyn HostContainer>, String>;

enum HostState {
    Idle,
    Creating(Vec<oneshot::Sender<ContainerReply>>),
    Ready(Arc<dyn HostContainer>),
}

/// Owner of the single off-screen host container
pub struct RenderPool {
    host: Arc<dyn SurfaceHost>,
    state: Arc<Mutex<HostState>>,
    load_timeout: Duration,
    metrics: ThumbnailMetrics,
}

impl RenderPool {
    pub fn new(host: Arc<dyn SurfaceHost>, load_timeout: Duration) -> Self {
        Self::with_metrics(host, load_timeout, ThumbnailMetrics::new())
    }

    pub fn with_metrics(
        host: Arc<dyn SurfaceHost>,
        load_timeout: Duration,
        metrics: ThumbnailMetrics,
    ) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(HostState::Idle)),
            load_timeout,
            metrics,
        }
    }

    /// Whether the host container has been created
    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, HostState::Ready(_))
    }

    /// Number of jobs waiting for the host container
    pub async fn queued(&self) -> usize {
        match &*self.state.lock().await {
            HostState::Creating(waiters) => waiters.len(),
            _ => 0,
        }
    }

    /// Load `job.url` into a fresh surface and paint it.
    ///
    /// A load that times out or is cut short is still painted and reported
    /// with a gateway status. The surface is destroyed whatever the outcome.
    pub async fn render(&self, job: &RenderJob) -> RenderResult<RenderedPage> {
        let container = self.container().await?;
        let mut surface = container
            .create_surface(job.render_width, job.render_height)
            .await?;

        let result = self.load_and_paint(surface.as_mut(), job).await;
        surface.destroy().await;
        result
    }

    async fn container(&self) -> RenderResult<Arc<dyn HostContainer>> {
        let receiver = {
            let mut state = self.state.lock().await;
            match &mut *state {
                HostState::Ready(container) => return Ok(container.clone()),
                HostState::Creating(waiters) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    trace!("Queued render job behind host creation ({} waiting)", waiters.len());
                    receiver
                }
                HostState::Idle => {
                    let (sender, receiver) = oneshot::channel();
                    *state = HostState::Creating(vec![sender]);
                    self.spawn_creation();
                    receiver
                }
            }
        };

        match receiver.await {
            Ok(Ok(container)) => Ok(container),
            Ok(Err(message)) => Err(RenderError::HostCreation { message }),
            Err(_) => Err(RenderError::HostCreation {
                message: "host creation task ended without a result".to_string(),
            }),
        }
    }

    fn spawn_creation(&self) {
        let host = self.host.clone();
        let state = self.state.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            debug!("Creating render host container");
            let started = Instant::now();
            let result = host.create_container().await;

            let mut state = state.lock().await;
            let next = match &result {
                Ok(container) => HostState::Ready(container.clone()),
                Err(_) => HostState::Idle,
            };
            let waiters = match std::mem::replace(&mut *state, next) {
                HostState::Creating(waiters) => waiters,
                _ => Vec::new(),
            };
            drop(state);

            match result {
                Ok(container) => {
                    metrics.record_host_creation(true);
                    info!(
                        "Render host container ready in {}ms, resuming {} queued jobs",
                        started.elapsed().as_millis(),
                        waiters.len()
                    );
                    for waiter in waiters {
                        let _ = waiter.send(Ok(container.clone()));
                    }
                }
                Err(e) => {
                    metrics.record_host_creation(false);
                    warn!(
                        "Render host container creation failed, failing {} queued jobs: {}",
                        waiters.len(),
                        e
                    );
                    let message = e.to_string();
                    for waiter in waiters {
                        let _ = waiter.send(Err(message.clone()));
                    }
                }
            }
        });
    }

    async fn load_and_paint(
        &self,
        surface: &mut dyn RenderSurface,
        job: &RenderJob,
    ) -> RenderResult<RenderedPage> {
        let mut events = surface.navigate(&job.url).await?;
        let top_document = surface.top_document();

        let wait_for_top = async {
            while let Some(event) = events.next().await {
                if event.document == top_document {
                    return Ok(event.status.unwrap_or(DEFAULT_LOAD_STATUS));
                }
                trace!(
                    "Ignoring load of nested document {} while rendering {}",
                    event.document, job.url
                );
            }
            Err(RenderError::LoadInterrupted {
                url: job.url.clone(),
            })
        };

        let loaded = tokio::time::timeout(self.load_timeout, wait_for_top)
            .await
            .unwrap_or_else(|_| {
                Err(RenderError::LoadTimeout {
                    url: job.url.clone(),
                    timeout: self.load_timeout,
                })
            });

        // A failed load still paints whatever the surface holds
        let status = match loaded {
            Ok(status) => status,
            Err(e) => match e.load_failure_status() {
                Some(status) => {
                    warn!("{}, painting the partial page with status {}", e, status);
                    status
                }
                None => return Err(e),
            },
        };

        debug!("Loaded {} with status {}", job.url, status);
        let bitmap = surface.paint().await?;
        Ok(RenderedPage { bitmap, status })
    }
}
