//! Queue, dispatcher and per-sink workers
//!
//! Producers hold a [`NotifyHandle`] and never block: when the bounded queue
//! is full the event is dropped and counted. The dispatcher consults the rate
//! limiter once per `(event, sink)` and hands the event to that sink's
//! worker. Workers deliver in FIFO order, one event at a time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Notifier, RateLimiter, SinkType, TemplateLoader, build_sinks};
use crate::config::NotifyConfig;
use crate::error::Result;
use crate::types::AlertEvent;

/// An event addressed to one sink, or to every sink when `sink` is `None`
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: AlertEvent,
    pub sink: Option<SinkType>,
}

#[derive(Debug, Default)]
pub struct NotifyStats {
    enqueued: AtomicU64,
    queue_full: AtomicU64,
    dispatched: AtomicU64,
    rate_limited: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    panics: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyStatsSnapshot {
    pub enqueued: u64,
    pub queue_full: u64,
    pub dispatched: u64,
    pub rate_limited: u64,
    pub delivered: u64,
    pub failed: u64,
    pub panics: u64,
}

impl NotifyStats {
    pub fn snapshot(&self) -> NotifyStatsSnapshot {
        NotifyStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the notification queue
#[derive(Debug, Clone)]
pub struct NotifyHandle {
    tx: Option<mpsc::Sender<Notification>>,
    stats: Arc<NotifyStats>,
}

impl NotifyHandle {
    /// A bare queue with its receiving end
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            tx: Some(tx),
            stats: Arc::new(NotifyStats::default()),
        };
        (handle, rx)
    }

    /// Handle that accepts nothing, used when notifications are disabled
    pub fn disabled() -> Self {
        Self {
            tx: None,
            stats: Arc::new(NotifyStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `event` for every sink. Returns false when it was dropped.
    pub fn enqueue(&self, event: AlertEvent) -> bool {
        self.push(Notification { event, sink: None })
    }

    /// Queue `event` for a single sink
    pub fn enqueue_for(&self, event: AlertEvent, sink: SinkType) -> bool {
        self.push(Notification {
            event,
            sink: Some(sink),
        })
    }

    fn push(&self, notification: Notification) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(notification) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(n)) => {
                self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event = n.event.event_type(),
                    agent_id = n.event.agent_id(),
                    "notification queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(n)) => {
                debug!(event = n.event.event_type(), "notification queue closed");
                false
            }
        }
    }

    pub fn stats(&self) -> NotifyStatsSnapshot {
        self.stats.snapshot()
    }
}

struct Worker {
    sink: SinkType,
    tx: mpsc::Sender<AlertEvent>,
}

pub struct NotificationManager {
    sinks: Vec<Arc<dyn Notifier>>,
    limiter: Arc<RateLimiter>,
    stats: Arc<NotifyStats>,
    rx: mpsc::Receiver<Notification>,
    worker_capacity: usize,
}

impl NotificationManager {
    pub fn new(config: &NotifyConfig, sinks: Vec<Arc<dyn Notifier>>) -> (Self, NotifyHandle) {
        let (handle, rx) = NotifyHandle::channel(config.queue_capacity);
        let manager = Self {
            sinks,
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            stats: Arc::clone(&handle.stats),
            rx,
            worker_capacity: config.max_batch_size.max(1),
        };
        (manager, handle)
    }

    /// Build every enabled sink and the manager in front of them
    pub fn from_config(
        config: &NotifyConfig,
        templates: Arc<TemplateLoader>,
        cancel: &CancellationToken,
    ) -> Result<(Self, NotifyHandle)> {
        let sinks = build_sinks(config, templates, cancel)?;
        info!(
            sinks = ?sinks.iter().map(|s| s.sink_type().as_str()).collect::<Vec<_>>(),
            "notification sinks configured"
        );
        Ok(Self::new(config, sinks))
    }

    pub fn sinks(&self) -> &[Arc<dyn Notifier>] {
        &self.sinks
    }

    /// Dispatch until cancelled or until every handle is dropped.
    ///
    /// On cancellation each worker finishes the event it is delivering and
    /// then stops; queued events are dropped. When the queue closes instead,
    /// workers drain what they already hold.
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        let mut workers = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let (tx, rx) = mpsc::channel(self.worker_capacity);
            workers.push(Worker {
                sink: sink.sink_type(),
                tx,
            });
            tasks.spawn(worker(Arc::clone(sink), rx, Arc::clone(&self.stats), cancel.clone()));
        }
        debug!(workers = workers.len(), "notification dispatcher started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("notification dispatcher cancelled");
                    break;
                }

                next = self.rx.recv() => match next {
                    Some(notification) => self.dispatch(notification, &workers),
                    None => {
                        debug!("notification queue closed");
                        break;
                    }
                }
            }
        }

        self.rx.close();
        drop(workers);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("notification worker aborted: {e}");
            }
        }
        info!("notification dispatcher stopped");
    }

    fn dispatch(&self, notification: Notification, workers: &[Worker]) {
        let Notification { event, sink } = notification;
        for worker in workers.iter().filter(|w| sink.is_none_or(|s| s == w.sink)) {
            // Reserve the queue slot first so a full backlog never spends rate budget.
            let permit = match worker.tx.try_reserve() {
                Ok(permit) => permit,
                Err(TrySendError::Full(())) => {
                    self.stats.queue_full.fetch_add(1, Ordering::Relaxed);
                    warn!(sink = %worker.sink, "sink worker backlog full, dropping event");
                    continue;
                }
                Err(TrySendError::Closed(())) => {
                    error!(sink = %worker.sink, "sink worker is gone");
                    continue;
                }
            };

            if !self.limiter.try_acquire(worker.sink, event.agent_id()) {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sink = %worker.sink,
                    event = event.event_type(),
                    agent_id = event.agent_id(),
                    "rate limit reached, dropping event"
                );
                continue;
            }

            permit.send(event.clone());
            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn worker(
    sink: Arc<dyn Notifier>,
    mut rx: mpsc::Receiver<AlertEvent>,
    stats: Arc<NotifyStats>,
    cancel: CancellationToken,
) {
    let sink_type = sink.sink_type();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        match AssertUnwindSafe(sink.send(&event)).catch_unwind().await {
            Ok(Ok(())) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(sink = %sink_type, event = event.event_type(), "notification delivered");
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    sink = %sink_type,
                    event = event.event_type(),
                    agent_id = event.agent_id(),
                    "notification failed: {e}"
                );
            }
            Err(_) => {
                stats.panics.fetch_add(1, Ordering::Relaxed);
                error!(sink = %sink_type, event = event.event_type(), "sink panicked while sending");
            }
        }
    }
    debug!(sink = %sink_type, "sink worker stopped");
}
