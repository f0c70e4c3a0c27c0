//! Delivery scheduler — timer-driven drain loop over the priority queue
//!
//! Each tick takes every high-priority envelope plus at most one normal and
//! one low envelope, and hands them to a spawned task: highs are delivered in
//! order, then normal and low run concurrently under a semaphore. A slow or
//! panicking receiver never holds up later ticks. A tick that finds a
//! previous pass still draining is skipped.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use switchboard_core::{AgentDirectory, EventHub, MessagePriority};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{Envelope, PriorityQueue, QueueDepth};

/// Configuration for the delivery scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between drain passes
    pub tick_interval: Duration,

    /// Maximum number of normal/low deliveries running at once
    pub max_concurrent_deliveries: usize,

    /// Number of recent (message id, receiver id) pairs remembered for dedupe
    pub dedupe_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            max_concurrent_deliveries: 16,
            dedupe_window: 4096,
        }
    }
}

/// Counters since the scheduler was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub enqueued: u64,
    pub duplicates: u64,
    pub delivered: u64,
    /// Receiver unknown, offline or without an intake
    pub dropped: u64,
    /// Receiver intake returned an error
    pub failed: u64,
    pub skipped_ticks: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    duplicates: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    skipped_ticks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
        }
    }
}

/// State shared with spawned delivery tasks
struct Dispatch {
    directory: Arc<dyn AgentDirectory>,
    events: Arc<EventHub>,
    counters: Counters,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Dispatch {
    /// Hand one envelope to its receiver and notify observers on success
    async fn deliver(&self, envelope: Envelope) {
        let message = &envelope.message;
        let receiver = message.receiver_id.as_str();

        match self.directory.resolve(receiver).await {
            None => {
                warn!(
                    "Scheduler: receiver '{}' of message {} not found, dropping",
                    receiver, message.id
                );
                Counters::bump(&self.counters.dropped);
                return;
            }
            Some(agent) if !agent.online => {
                warn!(
                    "Scheduler: receiver '{}' of message {} is offline, dropping",
                    receiver, message.id
                );
                Counters::bump(&self.counters.dropped);
                return;
            }
            Some(_) => {}
        }

        let Some(sink) = self.directory.sink(receiver).await else {
            warn!(
                "Scheduler: receiver '{}' has no intake, dropping message {}",
                receiver, message.id
            );
            Counters::bump(&self.counters.dropped);
            return;
        };

        match sink.deliver(message).await {
            Ok(()) => {
                Counters::bump(&self.counters.delivered);
                debug!(
                    "Scheduler: delivered {} ({}) {} -> {}",
                    message.id, envelope.priority, message.sender_id, receiver
                );
                if let Some(session_id) = &envelope.session_id {
                    self.events.publish_message(session_id, message).await;
                }
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!("Scheduler: delivery of {} to '{}' failed: {:#}", message.id, receiver, e);
            }
        }
    }

    /// Deliver on a task of its own so a panicking intake only loses its message
    async fn deliver_isolated(self: &Arc<Self>, envelope: Envelope) {
        let id = envelope.message.id.clone();
        let receiver = envelope.message.receiver_id.clone();
        let dispatch = Arc::clone(self);
        if let Err(e) = tokio::spawn(async move { dispatch.deliver(envelope).await }).await {
            Counters::bump(&self.counters.failed);
            error!("Scheduler: delivery of {} to '{}' aborted: {}", id, receiver, e);
        }
    }
}

/// Counts one delivery as in flight until dropped
struct InFlight {
    dispatch: Arc<Dispatch>,
}

impl InFlight {
    fn new(dispatch: &Arc<Dispatch>) -> Self {
        dispatch.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            dispatch: Arc::clone(dispatch),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.dispatch.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.dispatch.idle.notify_waiters();
        }
    }
}

/// Holds the draining flag for one pass and releases it on drop
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Priority-ordered, at-most-once delivery of routed messages
pub struct DeliveryScheduler {
    config: SchedulerConfig,
    queue: Mutex<PriorityQueue>,
    seen: Mutex<LruCache<(String, String), ()>>,
    draining: AtomicBool,
    permits: Arc<Semaphore>,
    dispatch: Arc<Dispatch>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DeliveryScheduler {
    pub fn new(directory: Arc<dyn AgentDirectory>, events: Arc<EventHub>) -> Self {
        Self::with_config(directory, events, SchedulerConfig::default())
    }

    pub fn with_config(
        directory: Arc<dyn AgentDirectory>,
        events: Arc<EventHub>,
        config: SchedulerConfig,
    ) -> Self {
        let window = NonZeroUsize::new(config.dedupe_window).unwrap_or(NonZeroUsize::MIN);
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1))),
            config,
            queue: Mutex::new(PriorityQueue::new()),
            seen: Mutex::new(LruCache::new(window)),
            draining: AtomicBool::new(false),
            dispatch: Arc::new(Dispatch {
                directory,
                events,
                counters: Counters::default(),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue an envelope. Returns false if the same message was already
    /// accepted for the same receiver.
    pub async fn enqueue(&self, envelope: Envelope) -> bool {
        let key = envelope.delivery_key();
        if self.seen.lock().await.put(key, ()).is_some() {
            Counters::bump(&self.dispatch.counters.duplicates);
            debug!(
                "Scheduler: duplicate delivery of {} to '{}' ignored",
                envelope.message.id, envelope.message.receiver_id
            );
            return false;
        }
        Counters::bump(&self.dispatch.counters.enqueued);
        self.queue.lock().await.push(envelope);
        true
    }

    /// Run one drain pass. Returns the number of envelopes dispatched, or
    /// `None` when another pass was still in flight.
    ///
    /// The pass itself never waits on a receiver. The batch goes to one
    /// spawned task that delivers the high envelopes in order and then starts
    /// the normal and low deliveries, each under a semaphore permit taken here.
    pub async fn tick(&self) -> Option<usize> {
        let Some(_drain) = DrainGuard::acquire(&self.draining) else {
            Counters::bump(&self.dispatch.counters.skipped_ticks);
            debug!("Scheduler: previous drain still running, skipping tick");
            return None;
        };

        let mut high = Vec::new();
        let mut rest = Vec::new();
        {
            let mut queue = self.queue.lock().await;
            for envelope in queue.next_batch() {
                if envelope.priority == MessagePriority::High {
                    high.push((envelope, InFlight::new(&self.dispatch)));
                    continue;
                }
                match self.permits.clone().try_acquire_owned() {
                    Ok(permit) => rest.push((envelope, permit, InFlight::new(&self.dispatch))),
                    Err(_) => {
                        debug!(
                            "Scheduler: delivery pool full, deferring {} to next tick",
                            envelope.message.id
                        );
                        queue.push_front(envelope);
                    }
                }
            }
        }

        let dispatched = high.len() + rest.len();
        if dispatched > 0 {
            let dispatch = Arc::clone(&self.dispatch);
            tokio::spawn(async move {
                for (envelope, _in_flight) in high {
                    dispatch.deliver_isolated(envelope).await;
                }
                for (envelope, permit, in_flight) in rest {
                    let dispatch = Arc::clone(&dispatch);
                    tokio::spawn(async move {
                        let _permit = permit;
                        let _in_flight = in_flight;
                        dispatch.deliver_isolated(envelope).await;
                    });
                }
            });
        }
        Some(dispatched)
    }
    /// Start the background tick loop. Returns false if already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Scheduler: already running");
            return false;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let scheduler = Arc::clone(self);
        let period = self.config.tick_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Scheduler: delivery loop started ({}ms tick)", period.as_millis());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Scheduler: delivery loop stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        scheduler.tick().await;
                    }
                }
            }
        });

        *running = Some((token, handle));
        true
    }

    /// Stop the background loop. Queued envelopes stay queued.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.running.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!("Scheduler: delivery loop ended abnormally: {}", e);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Queued envelopes per bucket
    pub async fn pending(&self) -> QueueDepth {
        self.queue.lock().await.depth()
    }

    /// Deliveries spawned but not yet finished
    pub fn in_flight(&self) -> usize {
        self.dispatch.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DeliveryStats {
        self.dispatch.counters.snapshot()
    }

    /// Drive ticks until the queue is empty and every spawned delivery has finished
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.dispatch.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.queue.lock().await.is_empty() {
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            } else if self.tick().await.is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }
}
