//! A single typed bus: bounded queue, drop policy, batching, worker-pool
//! dispatch, retry/backoff/DLQ, and hysteretic degradation (spec §4.7).

use crate::handler::Handler;
use crate::history::History;
use crate::metrics::{BusMetrics, BusMetricsSnapshot, GLOBAL_MONITOR};
use crate::pool::{EVENT_BUFFER_POOL, METADATA_POOL};
use crate::throttle::Throttler;
use multibus_core::{
    well_known, BusConfig, DegradationMode, DropPolicy, Event, EventError, EventStatus, EventType,
    Filter, Logger, Priority,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

type ErrorCallback = dyn Fn(&Event, &str, Option<&str>) + Send + Sync;
type DlqSink = dyn Fn(Event) + Send + Sync;

/// Hard deadline for `Bus::close` (spec §4.7.3: "hard deadline ≈200ms").
const CLOSE_DEADLINE: Duration = Duration::from_millis(200);

/// Minimal bounded queue supporting the admission policies spec §4.7.2
/// needs: non-blocking push, oldest-eviction, and a timed blocking push.
/// A plain `tokio::sync::mpsc` channel doesn't expose "peek and evict the
/// oldest" or a live length for the reserve-for-critical check, so this is
/// hand-rolled over a `VecDeque` behind one lock plus a `Notify` for the
/// drain loop to wake on.
struct SharedQueue {
    items: Mutex<VecDeque<Event>>,
    cap: AtomicUsize,
    item_added: Notify,
    space_freed: Notify,
}

impl SharedQueue {
    fn new(cap: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap: AtomicUsize::new(cap),
            item_added: Notify::new(),
            space_freed: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn try_push_back(&self, event: Event) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.cap.load(Ordering::Relaxed) {
            return false;
        }
        items.push_back(event);
        drop(items);
        self.item_added.notify_one();
        true
    }

    fn evict_oldest(&self) -> Option<Event> {
        let popped = self.items.lock().pop_front();
        if popped.is_some() {
            self.space_freed.notify_one();
        }
        popped
    }

    fn try_pop_front(&self) -> Option<Event> {
        let popped = self.items.lock().pop_front();
        if popped.is_some() {
            self.space_freed.notify_one();
        }
        popped
    }

    async fn push_blocking(&self, event: Event, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_push_back(event.clone()) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = self.space_freed.notified() => {}
                _ = tokio::time::sleep(remaining) => { return false; }
            }
        }
    }
}

#[derive(Clone)]
struct Subscription {
    id: u64,
    handler: Arc<dyn Handler>,
    active: Arc<AtomicBool>,
    filter: Option<Filter>,
}

#[derive(Clone, Copy, Debug)]
enum SubKind {
    BusLevel,
    Type(EventType),
}

struct CancelEntry {
    id: u64,
    kind: SubKind,
    active: Arc<AtomicBool>,
    bus: Weak<Bus>,
}

/// Idempotent cancellation for a subscription (spec §4.7.8). A filter
/// naming several event types expands into one per-type registration per
/// type (spec §4.2); this composes all of them behind a single handle so
/// cancelling it cancels every underlying registration together.
pub struct CancelHandle {
    entries: Vec<CancelEntry>,
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    fn single(id: u64, kind: SubKind, active: Arc<AtomicBool>, bus: Weak<Bus>) -> Self {
        Self {
            entries: vec![CancelEntry { id, kind, active, bus }],
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn combine(handles: Vec<CancelHandle>) -> Self {
        let entries = handles.into_iter().flat_map(|h| h.entries).collect();
        Self { entries, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in &self.entries {
            entry.active.store(false, Ordering::SeqCst);
            if let Some(bus) = entry.bus.upgrade() {
                bus.remove_subscription(entry.id, entry.kind);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub capacity: usize,
    pub running: usize,
    pub free: usize,
    /// Deliveries that found no free worker permit and ran inline on the
    /// drain task instead of being spawned (spec §4.9 worker-pool stats
    /// "cap/running/free/waiting").
    pub waiting: u64,
}

#[derive(Debug, Clone)]
pub struct BusStatus {
    pub healthy: bool,
    pub paused: bool,
    pub degraded: bool,
    pub queue_size: usize,
    pub subscriber_count: u64,
    pub degradation_count: u64,
    pub pause_count: u64,
    pub degraded_for: Option<Duration>,
    pub paused_for: Option<Duration>,
    pub worker_pool: WorkerPoolStats,
}

/// A single isolation domain: queue, drain loop, worker pool, history,
/// metrics, and throttler all owned exclusively by this bus (spec §3).
pub struct Bus {
    bus_type: multibus_core::BusType,
    config: RwLock<BusConfig>,
    queue: SharedQueue,
    history: History,
    metrics: BusMetrics,
    throttler: RwLock<Option<Throttler>>,
    logger: Arc<dyn Logger>,

    closed: AtomicBool,
    paused: AtomicBool,
    auto_paused: AtomicBool,
    degraded: AtomicBool,
    degraded_since: Mutex<Option<Instant>>,
    paused_since: Mutex<Option<Instant>>,
    degradation_count: AtomicU64,
    pause_count: AtomicU64,

    bus_level_subs: RwLock<Vec<Subscription>>,
    type_subs: RwLock<HashMap<EventType, Vec<Subscription>>>,
    next_sub_id: AtomicU64,
    subscriber_count: AtomicU64,

    retry_semaphore: RwLock<Option<Arc<Semaphore>>>,
    worker_semaphore: RwLock<Arc<Semaphore>>,
    inline_dispatch_count: AtomicU64,
    error_callback: RwLock<Option<Arc<ErrorCallback>>>,
    dlq_sink: RwLock<Option<Arc<DlqSink>>>,

    cancel_token: CancellationToken,
    drain_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Bus {
    pub fn new(bus_type: multibus_core::BusType, config: BusConfig, logger: Arc<dyn Logger>) -> Arc<Self> {
        let throttler = if config.enable_throttling {
            Some(Throttler::new(config.throttle_rate, config.throttle_burst as f64))
        } else {
            None
        };
        let retry_semaphore = if config.max_concurrent_retries > 0 {
            Some(Arc::new(Semaphore::new(config.max_concurrent_retries)))
        } else {
            None
        };
        let worker_permits = config.worker_count * 2;
        let history = History::new(config.history_size, config.history_max_age);
        let queue_cap = config.max_queue;

        let bus = Arc::new(Self {
            bus_type,
            queue: SharedQueue::new(queue_cap),
            history,
            metrics: BusMetrics::default(),
            throttler: RwLock::new(throttler),
            logger,
            closed: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            auto_paused: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            degraded_since: Mutex::new(None),
            paused_since: Mutex::new(None),
            degradation_count: AtomicU64::new(0),
            pause_count: AtomicU64::new(0),
            bus_level_subs: RwLock::new(Vec::new()),
            type_subs: RwLock::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            subscriber_count: AtomicU64::new(0),
            retry_semaphore: RwLock::new(retry_semaphore),
            worker_semaphore: RwLock::new(Arc::new(Semaphore::new(worker_permits))),
            inline_dispatch_count: AtomicU64::new(0),
            error_callback: RwLock::new(None),
            dlq_sink: RwLock::new(None),
            cancel_token: CancellationToken::new(),
            config: RwLock::new(config),
            drain_handle: Mutex::new(None),
        });
        Bus::spawn_drain_loop(&bus);
        bus
    }

    pub fn bus_type(&self) -> multibus_core::BusType {
        self.bus_type
    }

    pub fn set_error_callback(&self, cb: Arc<ErrorCallback>) {
        *self.error_callback.write() = Some(cb);
    }

    pub fn set_dlq_sink(&self, sink: Arc<DlqSink>) {
        *self.dlq_sink.write() = Some(sink);
    }

    // -- state machine -----------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        self.pause_internal(false);
    }

    pub fn resume(&self) {
        self.resume_internal();
    }

    fn pause_internal(&self, auto: bool) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            *self.paused_since.lock() = Some(Instant::now());
            self.pause_count.fetch_add(1, Ordering::Relaxed);
        }
        self.auto_paused.store(auto, Ordering::SeqCst);
    }

    fn resume_internal(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            *self.paused_since.lock() = None;
        }
        self.auto_paused.store(false, Ordering::SeqCst);
    }

    /// Closes the bus, cancels the drain loop, and waits briefly for a
    /// best-effort final drain (spec §4.7.3: "hard deadline ≈200ms"). If the
    /// drain task hasn't finished by the deadline it is aborted outright —
    /// no handler runs on a bus that `close` has already returned from.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_token.cancel();
        let handle = self.drain_handle.lock().take();
        if let Some(handle) = handle {
            let abort_handle = handle.abort_handle();
            if tokio::time::timeout(CLOSE_DEADLINE, handle).await.is_err() {
                abort_handle.abort();
            }
        }
    }

    // -- publish --------------------------------------------------------

    /// Admission per spec §4.7.2: throttle, metrics/history, degradation
    /// evaluation, then admission control honoring reserve-for-critical
    /// and the configured drop policy.
    pub async fn publish(&self, event: Event) {
        if self.is_closed() {
            return;
        }

        if self.config.read().enable_throttling {
            let throttled = match self.throttler.read().as_ref() {
                Some(t) => !t.try_acquire(),
                None => false,
            };
            if throttled {
                self.record_drop("throttled", &event);
                return;
            }
        }

        self.metrics.record_published();
        GLOBAL_MONITOR.record_published(event.priority);

        if self.config.read().enable_history {
            self.history.add(event.clone());
        }

        self.evaluate_degradation();

        let (reserve, cap, drop_policy, block_timeout) = {
            let cfg = self.config.read();
            (cfg.reserve_for_critical, cfg.max_queue, cfg.drop_policy, cfg.enqueue_block_timeout)
        };

        if reserve > 0 && event.priority != Priority::Critical {
            let used = self.queue.len();
            if used >= cap.saturating_sub(reserve) {
                self.record_drop("reserve_for_critical", &event);
                return;
            }
        }

        if self.queue.try_push_back(event.clone()) {
            return;
        }

        match drop_policy {
            DropPolicy::DropNewest => self.record_drop("drop_newest", &event),
            DropPolicy::DropOldest => {
                self.queue.evict_oldest();
                if !self.queue.try_push_back(event.clone()) {
                    self.record_drop("drop_oldest_failed", &event);
                }
            }
            DropPolicy::Block => {
                if !self.queue.push_blocking(event.clone(), block_timeout).await {
                    self.record_drop("block_timeout", &event);
                }
            }
        }
    }

    fn record_drop(&self, reason: &str, event: &Event) {
        self.metrics.record_dropped();
        GLOBAL_MONITOR.record_dropped(reason);
        if let Some(cb) = self.error_callback.read().as_ref() {
            cb(event, reason, None);
        }
        self.logger.log(
            multibus_core::LogLevel::Debug,
            "event dropped",
            &[("bus", &self.bus_type.to_string()), ("event_id", &event.id.0), ("reason", reason)],
        );
    }

    /// Hysteretic overload response (spec §4.7.6).
    fn evaluate_degradation(&self) {
        let cfg = self.config.read();
        if !cfg.enable_degradation {
            return;
        }
        let usage = (self.queue.len() as u64 * 100) / cfg.max_queue.max(1) as u64;
        let degraded_now = self.degraded.load(Ordering::Relaxed);

        if !degraded_now && usage >= cfg.degradation_threshold as u64 {
            self.degraded.store(true, Ordering::SeqCst);
            *self.degraded_since.lock() = Some(Instant::now());
            self.degradation_count.fetch_add(1, Ordering::Relaxed);
            if cfg.degradation_mode == DegradationMode::Pause {
                self.pause_internal(true);
            }
            GLOBAL_MONITOR.set_healthy(false);
        } else if degraded_now && usage <= cfg.degradation_recover_threshold as u64 {
            self.degraded.store(false, Ordering::SeqCst);
            *self.degraded_since.lock() = None;
            if self.auto_paused.load(Ordering::Relaxed) {
                self.resume_internal();
            }
            GLOBAL_MONITOR.set_healthy(true);
        }
    }

    // -- subscriptions ----------------------------------------------------

    pub fn subscribe(self: &Arc<Self>, handler: Arc<dyn Handler>) -> CancelHandle {
        self.register(SubKind::BusLevel, None, handler)
    }

    pub fn subscribe_to(self: &Arc<Self>, event_type: EventType, handler: Arc<dyn Handler>) -> CancelHandle {
        self.register(SubKind::Type(event_type), None, handler)
    }

    /// Type-scoped filters index per event type (cheaper, spec §4.2): one
    /// registration per type named in the filter, composed behind a single
    /// returned handle. Everything else takes a bus-level subscription
    /// evaluated per-event.
    pub fn subscribe_with_filter(self: &Arc<Self>, filter: Filter, handler: Arc<dyn Handler>) -> CancelHandle {
        if filter.is_type_scoped() {
            let handles = filter
                .event_types
                .iter()
                .map(|ty| self.register(SubKind::Type(*ty), Some(filter.clone()), Arc::clone(&handler)))
                .collect();
            CancelHandle::combine(handles)
        } else {
            self.register(SubKind::BusLevel, Some(filter), handler)
        }
    }

    fn register(self: &Arc<Self>, kind: SubKind, filter: Option<Filter>, handler: Arc<dyn Handler>) -> CancelHandle {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let sub = Subscription { id, handler, active: Arc::clone(&active), filter };
        match kind {
            SubKind::BusLevel => self.bus_level_subs.write().push(sub),
            SubKind::Type(t) => self.type_subs.write().entry(t).or_default().push(sub),
        }
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        CancelHandle::single(id, kind, active, Arc::downgrade(self))
    }

    fn remove_subscription(&self, id: u64, kind: SubKind) {
        let removed = match kind {
            SubKind::BusLevel => {
                let mut subs = self.bus_level_subs.write();
                let before = subs.len();
                subs.retain(|s| s.id != id);
                before != subs.len()
            }
            SubKind::Type(t) => {
                let mut subs = self.type_subs.write();
                if let Some(list) = subs.get_mut(&t) {
                    let before = list.len();
                    list.retain(|s| s.id != id);
                    before != list.len()
                } else {
                    false
                }
            }
        };
        if removed {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn matching_subscriptions(&self, event: &Event) -> Vec<Subscription> {
        let mut out: Vec<Subscription> = self.bus_level_subs.read().clone();
        if let Some(list) = self.type_subs.read().get(&event.event_type) {
            out.extend(list.iter().cloned());
        }
        out.retain(|s| s.active.load(Ordering::Relaxed) && s.filter.as_ref().map_or(true, |f| f.matches(event)));
        out
    }

    // -- drain loop -------------------------------------------------------

    fn spawn_drain_loop(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            bus.drain_loop().await;
        });
        *self.drain_handle.lock() = Some(handle);
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            if self.cancel_token.is_cancelled() {
                break;
            }
            if self.is_paused() {
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
            let flush_interval = self.config.read().flush_interval;
            tokio::select! {
                _ = tokio::time::sleep(flush_interval) => {}
                _ = self.queue.item_added.notified() => {}
                _ = self.cancel_token.cancelled() => { break; }
            }
            self.drain_once().await;
            GLOBAL_MONITOR.set_queue_size(self.queue.len());
        }
        self.final_drain().await;
    }

    async fn drain_once(self: &Arc<Self>) {
        let batch_size = self.config.read().batch_size;
        let mut buf = EVENT_BUFFER_POOL.get_with_capacity(batch_size);
        while buf.len() < batch_size {
            match self.queue.try_pop_front() {
                Some(ev) => buf.push(ev),
                None => break,
            }
        }
        if buf.is_empty() {
            EVENT_BUFFER_POOL.put(buf);
            return;
        }
        let ordered = weighted_priority_reorder(buf);
        self.dispatch_batch(ordered).await;
    }

    /// Best-effort drain on close. Enforces its own deadline (spec §4.7.3:
    /// "hard deadline ≈200ms ... then exit") rather than relying solely on
    /// the caller's `close()` timeout wrapper, so a slow handler can't keep
    /// this loop — and therefore deliveries — running past the deadline.
    async fn final_drain(self: &Arc<Self>) {
        let deadline = Instant::now() + CLOSE_DEADLINE;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let batch_size = self.config.read().batch_size;
            let mut buf = EVENT_BUFFER_POOL.get_with_capacity(batch_size);
            while buf.len() < batch_size {
                match self.queue.try_pop_front() {
                    Some(ev) => buf.push(ev),
                    None => break,
                }
            }
            if buf.is_empty() {
                EVENT_BUFFER_POOL.put(buf);
                break;
            }
            let ordered = weighted_priority_reorder(buf);
            self.dispatch_batch(ordered).await;
        }
    }

    /// Submissions per batch capped at `WorkerCount·2`; remainder runs
    /// synchronously to bound burstiness (spec §4.7.3).
    async fn dispatch_batch(self: &Arc<Self>, mut batch: Vec<Event>) {
        let degraded_throttle = self.is_degraded()
            && self.config.read().enable_degradation
            && self.config.read().degradation_mode == DegradationMode::Throttle;

        for event in batch.drain(..) {
            if degraded_throttle {
                let admitted = match self.throttler.read().as_ref() {
                    Some(t) => t.try_acquire(),
                    None => true,
                };
                if !admitted {
                    self.record_drop("throttled", &event);
                    continue;
                }
            }

            let targets = self.matching_subscriptions(&event);
            for target in targets {
                let worker_sem = Arc::clone(&self.worker_semaphore.read());
                match worker_sem.try_acquire_owned() {
                    Ok(permit) => {
                        let bus = Arc::clone(self);
                        let handler = target.handler;
                        let active = target.active;
                        let ev = event.clone();
                        tokio::spawn(async move {
                            bus.deliver_with_retries(handler, active, ev, 1, None).await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        self.inline_dispatch_count.fetch_add(1, Ordering::Relaxed);
                        self.clone_arc()
                            .deliver_with_retries(target.handler, target.active, event.clone(), 1, None)
                            .await;
                    }
                }
            }
        }
        EVENT_BUFFER_POOL.put(batch);
    }

    fn clone_arc(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    /// Wraps a single handler invocation: panic recovery, latency/failure
    /// accounting, and retry scheduling (spec §4.7.4).
    fn deliver_with_retries(
        self: Arc<Self>,
        handler: Arc<dyn Handler>,
        active: Arc<AtomicBool>,
        event: Event,
        attempt: u32,
        retry_permit: Option<Arc<tokio::sync::OwnedSemaphorePermit>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
        if !active.load(Ordering::Relaxed) || self.is_closed() {
            return;
        }
        let start = Instant::now();
        let outcome = futures::FutureExt::catch_unwind(AssertUnwindSafe(handler.handle(event.clone()))).await;

        match outcome {
            Ok(()) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                self.metrics.record_processed(latency_ms);
                GLOBAL_MONITOR.record_processed(latency_ms);
            }
            Err(panic) => {
                self.metrics.record_failed();
                let reason = panic_message(&panic);
                GLOBAL_MONITOR.record_failed(reason.clone());

                let max_retries = self.config.read().max_retries;
                if attempt <= max_retries {
                    let permit = match retry_permit {
                        Some(p) => Some(p),
                        None => {
                            let max_concurrent = self.config.read().max_concurrent_retries;
                            if max_concurrent == 0 {
                                None
                            } else {
                                let sem = self.retry_semaphore.read().clone();
                                match sem {
                                    Some(sem) => match sem.try_acquire_owned() {
                                        Ok(p) => Some(Arc::new(p)),
                                        Err(_) => {
                                            self.emit_dlq(event, attempt, "retry capacity exhausted".into()).await;
                                            return;
                                        }
                                    },
                                    None => None,
                                }
                            }
                        }
                    };
                    let delay = backoff_delay(attempt);
                    let bus = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        bus.deliver_with_retries(handler, active, event, attempt + 1, permit).await;
                    });
                } else {
                    self.emit_dlq(event, attempt, reason).await;
                }
            }
        }
        })
    }

    /// Emits a synthetic `ErrorOccurred` event after retries are exhausted
    /// (spec §4.7.4, glossary "DLQ event").
    async fn emit_dlq(&self, original: Event, attempts: u32, reason: String) {
        let mut meta = METADATA_POOL.get();
        for (k, v) in original.cloned_metadata() {
            meta.entry(k).or_insert(v);
        }
        meta.insert("bus_type".into(), serde_json::json!(self.bus_type.to_string()));
        meta.insert("event_type".into(), serde_json::json!(original.event_type.0));
        meta.insert("attempts".into(), serde_json::json!(attempts));
        meta.insert("reason".into(), serde_json::json!("handler panic"));

        let dlq_event = Event::new(well_known::ERROR_OCCURRED, original.plugin_id.clone(), "bus::dlq")
            .with_priority(Priority::High)
            .with_status(EventStatus::DeadLettered)
            .with_error(reason)
            .with_metadata(meta);

        self.logger.log(
            multibus_core::LogLevel::Warn,
            "handler exhausted retries, emitting DLQ event",
            &[("bus", &self.bus_type.to_string()), ("event_id", &original.id.0), ("attempts", &attempts.to_string())],
        );

        if let Some(sink) = self.dlq_sink.read().clone() {
            sink(dlq_event);
        }
    }

    // -- hot reconfiguration ----------------------------------------------

    /// Hot reconfiguration per spec §4.7.7; `max_queue`/`flush_interval`
    /// cannot change without rebuilding the drain loop, so those are
    /// rejected here rather than silently ignored.
    pub fn update_config(&self, new_cfg: BusConfig) -> Result<(), EventError> {
        new_cfg.validate()?;
        let old = self.config.read().clone();
        if new_cfg.max_queue != old.max_queue {
            return Err(EventError::ConfigInvalid {
                bus: self.bus_type,
                reason: "max_queue cannot be hot-reconfigured".into(),
            });
        }
        if new_cfg.flush_interval != old.flush_interval {
            return Err(EventError::ConfigInvalid {
                bus: self.bus_type,
                reason: "flush_interval cannot be hot-reconfigured".into(),
            });
        }

        if new_cfg.history_size != old.history_size {
            self.history.resize(new_cfg.history_size);
        }
        if new_cfg.worker_count != old.worker_count {
            *self.worker_semaphore.write() = Arc::new(Semaphore::new(new_cfg.worker_count * 2));
        }
        if new_cfg.max_concurrent_retries != old.max_concurrent_retries {
            let sem = if new_cfg.max_concurrent_retries > 0 {
                Some(Arc::new(Semaphore::new(new_cfg.max_concurrent_retries)))
            } else {
                None
            };
            *self.retry_semaphore.write() = sem;
        }
        if new_cfg.enable_throttling {
            let mut throttler = self.throttler.write();
            *throttler = Some(match throttler.take() {
                Some(existing) => existing.reconfigure(new_cfg.throttle_rate, new_cfg.throttle_burst as f64),
                None => Throttler::new(new_cfg.throttle_rate, new_cfg.throttle_burst as f64),
            });
        } else {
            *self.throttler.write() = None;
        }

        *self.config.write() = new_cfg;
        Ok(())
    }

    // -- observability ------------------------------------------------

    pub fn metrics_snapshot(&self) -> BusMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn status(&self) -> BusStatus {
        let worker_cap = self.worker_semaphore.read().available_permits();
        BusStatus {
            healthy: !self.is_degraded() && !self.is_closed(),
            paused: self.is_paused(),
            degraded: self.is_degraded(),
            queue_size: self.queue.len(),
            subscriber_count: self.subscriber_count.load(Ordering::Relaxed),
            degradation_count: self.degradation_count.load(Ordering::Relaxed),
            pause_count: self.pause_count.load(Ordering::Relaxed),
            degraded_for: self.degraded_since.lock().map(|t| t.elapsed()),
            paused_for: self.paused_since.lock().map(|t| t.elapsed()),
            worker_pool: WorkerPoolStats {
                capacity: self.config.read().worker_count * 2,
                running: (self.config.read().worker_count * 2).saturating_sub(worker_cap),
                free: worker_cap,
                waiting: self.inline_dispatch_count.load(Ordering::Relaxed),
            },
        }
    }
}

/// Reorders a drained batch favoring higher priorities while guaranteeing
/// forward progress for lower ones: weights start at 8:4:2:1
/// (critical:high:normal:low) and decay by one each round, floored at 1
/// (spec §4.7.3, glossary "weighted-priority ordering").
fn weighted_priority_reorder(events: Vec<Event>) -> Vec<Event> {
    let mut buckets: [VecDeque<Event>; 4] = Default::default();
    for event in events {
        let idx = match event.priority {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        };
        buckets[idx].push_back(event);
    }

    let total: usize = buckets.iter().map(|b| b.len()).sum();
    let mut weights = [8usize, 4, 2, 1];
    let mut out = Vec::with_capacity(total);

    while buckets.iter().any(|b| !b.is_empty()) {
        for (i, bucket) in buckets.iter_mut().enumerate() {
            for _ in 0..weights[i] {
                match bucket.pop_front() {
                    Some(ev) => out.push(ev),
                    None => break,
                }
            }
        }
        for weight in weights.iter_mut() {
            *weight = weight.saturating_sub(1).max(1);
        }
    }
    out
}

/// `10ms · 2^(attempt-1)`, jittered into `[0.75, 1.25)` of base, capped at
/// 5s (spec §4.7.5).
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base_ms = 10f64 * 2f64.powi(attempt as i32 - 1);
    let base_ms = base_ms.min(5000.0);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    let delayed = (base_ms * jitter).min(5000.0).max(0.0);
    Duration::from_millis(delayed as u64)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use multibus_core::{well_known, BusType, NullLogger};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn test_config(bus_type: BusType) -> BusConfig {
        let mut cfg = BusConfig::defaults_for(bus_type);
        cfg.flush_interval = Duration::from_millis(5);
        cfg
    }

    #[tokio::test]
    async fn basic_fan_out_delivers_to_all_subscribers() {
        let bus = Bus::new(BusType::Plugin, test_config(BusType::Plugin), Arc::new(NullLogger));
        let count_a = Arc::new(StdAtomicUsize::new(0));
        let count_b = Arc::new(StdAtomicUsize::new(0));
        let ca = Arc::clone(&count_a);
        let cb = Arc::clone(&count_b);
        let _h1 = bus.subscribe_to(
            well_known::PLUGIN_STARTED,
            Arc::new(FnHandler::new(move |_ev| {
                let ca = Arc::clone(&ca);
                async move {
                    ca.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );
        let _h2 = bus.subscribe_to(
            well_known::PLUGIN_STARTED,
            Arc::new(FnHandler::new(move |_ev| {
                let cb = Arc::clone(&cb);
                async move {
                    cb.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        for _ in 0..10 {
            bus.publish(Event::new(well_known::PLUGIN_STARTED, "p1", "test")).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(count_a.load(Ordering::SeqCst), 10);
        assert_eq!(count_b.load(Ordering::SeqCst), 10);
        let snap = bus.metrics_snapshot();
        assert_eq!(snap.published, 10);
        assert_eq!(snap.dropped, 0);
    }

    #[tokio::test]
    async fn overload_drops_newest_when_queue_is_full() {
        let mut cfg = test_config(BusType::Business);
        cfg.max_queue = 4;
        cfg.drop_policy = DropPolicy::DropNewest;
        cfg.worker_count = 1;
        cfg.batch_size = 1;
        let bus = Bus::new(BusType::Business, cfg, Arc::new(NullLogger));
        bus.pause();

        for _ in 0..12 {
            bus.publish(Event::new(well_known::METRICS_REPORTED, "p1", "test")).await;
        }
        let snap = bus.metrics_snapshot();
        assert!(snap.dropped >= 7, "expected at least 7 drops, got {}", snap.dropped);
    }

    #[tokio::test]
    async fn throttling_admits_only_burst_tokens() {
        let mut cfg = test_config(BusType::Metrics);
        cfg.enable_throttling = true;
        cfg.throttle_rate = 10.0;
        cfg.throttle_burst = 2;
        let bus = Bus::new(BusType::Metrics, cfg, Arc::new(NullLogger));

        for _ in 0..20 {
            bus.publish(Event::new(well_known::METRICS_REPORTED, "p1", "test")).await;
        }
        let snap = bus.metrics_snapshot();
        assert!(snap.dropped >= 15, "expected most of 20 events throttled, got {}", snap.dropped);
    }

    #[tokio::test]
    async fn degradation_sets_in_pause_mode_and_recovers() {
        let mut cfg = test_config(BusType::Resource);
        cfg.max_queue = 100;
        cfg.degradation_threshold = 90;
        cfg.degradation_recover_threshold = 70;
        cfg.degradation_mode = DegradationMode::Pause;
        cfg.worker_count = 1;
        let bus = Bus::new(BusType::Resource, cfg, Arc::new(NullLogger));
        bus.pause();

        for _ in 0..95 {
            bus.publish(Event::new(well_known::RESOURCE_EXHAUSTED, "p1", "test")).await;
        }
        assert!(bus.is_degraded());
        assert!(bus.is_paused());
    }

    #[tokio::test]
    async fn filtered_listener_only_observes_matching_plugin() {
        let bus = Bus::new(BusType::Plugin, test_config(BusType::Plugin), Arc::new(NullLogger));
        let seen = Arc::new(StdAtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let filter = Filter::new()
            .with_plugin_ids(["p1".to_string()])
            .with_event_types([well_known::PLUGIN_STARTED]);
        let handle = bus.subscribe_with_filter(
            filter,
            Arc::new(FnHandler::new(move |_ev| {
                let seen2 = Arc::clone(&seen2);
                async move {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        bus.publish(Event::new(well_known::PLUGIN_STARTED, "p1", "test")).await;
        bus.publish(Event::new(well_known::PLUGIN_STARTED, "p2", "test")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        handle.cancel();
        bus.publish(Event::new(well_known::PLUGIN_STARTED, "p1", "test")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multi_type_filter_cancel_stops_every_type() {
        let bus = Bus::new(BusType::Plugin, test_config(BusType::Plugin), Arc::new(NullLogger));
        let seen = Arc::new(StdAtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let filter = Filter::new().with_event_types([well_known::PLUGIN_STARTED, well_known::PLUGIN_STOPPED]);
        let handle = bus.subscribe_with_filter(
            filter,
            Arc::new(FnHandler::new(move |_ev| {
                let seen2 = Arc::clone(&seen2);
                async move {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );

        bus.publish(Event::new(well_known::PLUGIN_STARTED, "p1", "test")).await;
        bus.publish(Event::new(well_known::PLUGIN_STOPPED, "p1", "test")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        handle.cancel();
        bus.publish(Event::new(well_known::PLUGIN_STARTED, "p1", "test")).await;
        bus.publish(Event::new(well_known::PLUGIN_STOPPED, "p1", "test")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2, "cancelling a multi-type handle must stop every type it registered");
        assert_eq!(bus.status().subscriber_count, 0, "both per-type registrations must be removed, not just the first");
    }

    #[tokio::test]
    async fn close_enforces_its_deadline_and_stops_new_deliveries() {
        let mut cfg = test_config(BusType::Plugin);
        cfg.worker_count = 1;
        cfg.batch_size = 1;
        cfg.max_retries = 0;
        let bus = Bus::new(BusType::Plugin, cfg, Arc::new(NullLogger));
        bus.pause();

        let count = Arc::new(StdAtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _h = bus.subscribe(Arc::new(FnHandler::new(move |_ev| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        })));

        for _ in 0..20 {
            bus.publish(Event::new(well_known::PLUGIN_STARTED, "p1", "test")).await;
        }

        let start = Instant::now();
        bus.close().await;
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "close must honor its ~200ms deadline instead of draining a backlog of slow handlers to completion"
        );

        let after_close = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            count.load(Ordering::SeqCst),
            after_close,
            "no handler invocation may start once close() has returned"
        );
    }

    #[test]
    fn weighted_reorder_favors_critical_but_keeps_low_progressing() {
        let mut events = Vec::new();
        for _ in 0..10 {
            events.push(Event::new(well_known::HEALTH_CHECK, "p1", "test").with_priority(Priority::Critical));
        }
        for _ in 0..10 {
            events.push(Event::new(well_known::HEALTH_CHECK, "p1", "test").with_priority(Priority::Low));
        }
        let ordered = weighted_priority_reorder(events);
        assert_eq!(ordered.len(), 20);
        assert_eq!(ordered[0].priority, Priority::Critical);
        assert!(ordered.iter().any(|e| e.priority == Priority::Low));
    }

    #[test]
    fn backoff_grows_and_caps_at_five_seconds() {
        assert!(backoff_delay(1) < Duration::from_millis(20));
        assert!(backoff_delay(20) <= Duration::from_secs(5));
    }
}
