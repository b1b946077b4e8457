use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds how many flow steps run concurrently within one execution.
///
/// A gate without a limit admits everything; permits are RAII and release on
/// drop, so a panicking step cannot leak capacity.
#[derive(Clone, Default)]
pub struct ParallelismGate {
    semaphore: Option<Arc<Semaphore>>,
    metrics: Arc<GateMetrics>,
}

impl ParallelismGate {
    pub fn new(limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            Self {
                semaphore: Some(Arc::new(Semaphore::new(limit))),
                metrics: Arc::new(GateMetrics {
                    limit: Some(limit),
                    throttled: AtomicU64::new(0),
                    inflight: AtomicU64::new(0),
                }),
            }
        } else {
            Self::default()
        }
    }

    pub async fn acquire(&self) -> GatePermit {
        if let Some(semaphore) = &self.semaphore {
            match semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    self.metrics.inflight.fetch_add(1, Ordering::Relaxed);
                    GatePermit {
                        inner: Some(permit),
                        metrics: Arc::clone(&self.metrics),
                    }
                }
                Err(_) => {
                    self.metrics.throttled.fetch_add(1, Ordering::Relaxed);
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("parallelism semaphore closed");
                    self.metrics.inflight.fetch_add(1, Ordering::Relaxed);
                    GatePermit {
                        inner: Some(permit),
                        metrics: Arc::clone(&self.metrics),
                    }
                }
            }
        } else {
            GatePermit {
                inner: None,
                metrics: Arc::clone(&self.metrics),
            }
        }
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            limit: self.metrics.limit,
            inflight: self.metrics.inflight.load(Ordering::Relaxed),
            throttled: self.metrics.throttled.load(Ordering::Relaxed),
        }
    }
}

pub struct GatePermit {
    inner: Option<OwnedSemaphorePermit>,
    metrics: Arc<GateMetrics>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.metrics.inflight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct GateMetrics {
    limit: Option<usize>,
    throttled: AtomicU64,
    inflight: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct GateSnapshot {
    pub limit: Option<usize>,
    pub inflight: u64,
    pub throttled: u64,
}

impl GateSnapshot {
    pub fn saturated(&self) -> bool {
        if let Some(limit) = self.limit {
            self.inflight >= limit as u64
        } else {
            false
        }
    }
}
