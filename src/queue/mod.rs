//! Request Queue — shards in-flight work by `(service, model family)`
//! and dispatches it against the Key Pool, honoring queueing priority
//! between user classes and streaming/blocking requests.
//!
//! Grounded on the teacher's `server::mod` dispatch loop (background
//! task per connection, `tokio::sync::mpsc` handoff, graceful shutdown
//! via a cancellation flag) and `auth::RateLimiter` (per-caller
//! bookkeeping keyed by a composite key, the same shape reused here for
//! `(Service, ModelFamily)` shards).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{info, warn};

use crate::family::{ModelFamily, Service};
use crate::keypool::{Key, Pool};
use crate::userstore::UserType;

/// Default keep-alive cadence while a request waits in queue for a key
/// to free up, so a client holding an SSE connection doesn't time out.
/// Overridable per `RequestQueue` from configuration (`heartbeatThresholdMs`,
/// `heartbeatIntervalMs`).
pub const HEARTBEAT_THRESHOLD: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shard {
    pub service: Service,
    pub family: ModelFamily,
}

/// Ordering key for queued requests within a shard. Special users
/// before normal before temporary; within the same user class,
/// streaming requests before blocking ones; ties broken by arrival
/// order (FIFO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Priority {
    user_type: UserType,
    is_streaming: bool,
    sequence: u64,
}

fn user_rank(t: UserType) -> u8 {
    match t {
        UserType::Special => 0,
        UserType::Normal => 1,
        UserType::Temporary => 2,
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        user_rank(self.user_type)
            .cmp(&user_rank(other.user_type))
            .then_with(|| other.is_streaming.cmp(&self.is_streaming))
            .then_with(|| self.sequence.cmp(&other.sequence))
            // BinaryHeap is a max-heap; we want the *smallest* priority
            // value dispatched first, so reverse the final comparison.
            .reverse()
    }
}
impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct QueuedRequest {
    priority: Priority,
    respond: oneshot::Sender<Arc<Key>>,
}
impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for QueuedRequest {}
impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
    }
}

struct ShardQueue {
    heap: BinaryHeap<QueuedRequest>,
    sequence: u64,
}

/// Owns one priority heap per `(service, family)` shard and a dispatch
/// loop that wakes whenever a key might have freed up.
pub struct RequestQueue {
    pool: Arc<Pool>,
    shards: Mutex<std::collections::HashMap<Shard, ShardQueue>>,
    wake: Notify,
    shutting_down: std::sync::atomic::AtomicBool,
    heartbeat_threshold: Duration,
    heartbeat_interval: Duration,
}

pub enum Admission {
    Key(Arc<Key>),
    /// Queue is draining for shutdown; caller should respond 503.
    ShuttingDown,
    /// Every key for this shard is disabled; caller should respond 503
    /// `NoAvailableKey` immediately rather than queue a request that
    /// can never be served (§4.2 "Lockout computation").
    NoAvailableKey,
}

impl RequestQueue {
    pub fn new(pool: Arc<Pool>) -> Arc<Self> {
        Self::with_heartbeat(pool, HEARTBEAT_THRESHOLD, HEARTBEAT_INTERVAL)
    }

    /// Same as `new`, but with the heartbeat cadence taken from
    /// configuration (`heartbeatThresholdMs`/`heartbeatIntervalMs`)
    /// rather than the built-in defaults.
    pub fn with_heartbeat(pool: Arc<Pool>, heartbeat_threshold: Duration, heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(RequestQueue {
            pool,
            shards: Mutex::new(std::collections::HashMap::new()),
            wake: Notify::new(),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            heartbeat_threshold,
            heartbeat_interval,
        })
    }

    /// Enqueue a request for a key on this shard and wait for one to
    /// become available. The first heartbeat fires after
    /// `heartbeat_threshold`; every one after that fires on
    /// `heartbeat_interval`, matching §4.3's "writes SSE headers and
    /// begins sending periodic keep-alive comment lines". `None` means
    /// the request was cancelled by the caller before a key was
    /// assigned.
    pub async fn admit(
        self: &Arc<Self>,
        shard: Shard,
        user_type: UserType,
        is_streaming: bool,
        mut on_heartbeat: impl FnMut(),
        cancelled: impl std::future::Future<Output = ()>,
    ) -> Admission {
        if self.shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
            return Admission::ShuttingDown;
        }
        if self.pool.available(shard.service, shard.family) == 0 {
            return Admission::NoAvailableKey;
        }

        let (tx, mut rx) = oneshot::channel();
        {
            let mut shards = self.shards.lock().await;
            let entry = shards.entry(shard).or_insert_with(|| ShardQueue {
                heap: BinaryHeap::new(),
                sequence: 0,
            });
            let sequence = entry.sequence;
            entry.sequence += 1;
            entry.heap.push(QueuedRequest {
                priority: Priority {
                    user_type,
                    is_streaming,
                    sequence,
                },
                respond: tx,
            });
        }
        self.wake.notify_waiters();

        tokio::pin!(cancelled);
        let mut heartbeat_sent = false;
        loop {
            let sleep_for = if heartbeat_sent {
                self.heartbeat_interval
            } else {
                self.heartbeat_threshold
            };
            tokio::select! {
                key = &mut rx => {
                    return match key {
                        Ok(key) => Admission::Key(key),
                        Err(_) => Admission::ShuttingDown,
                    };
                }
                _ = tokio::time::sleep(sleep_for) => {
                    on_heartbeat();
                    heartbeat_sent = true;
                }
                _ = &mut cancelled => {
                    return Admission::ShuttingDown;
                }
            }
        }
    }

    /// Background task: repeatedly tries to hand out a key to the
    /// highest-priority waiter in any shard. Exits once shutdown is
    /// signalled and every shard has drained.
    pub async fn run_dispatch_loop(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("request queue entering shutdown drain");
                    self.shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
                    self.drain_with_rejection().await;
                    return;
                }
                _ = self.try_dispatch_all() => {}
            }
        }
    }

    async fn try_dispatch_all(self: &Arc<Self>) {
        let shard_keys: Vec<Shard> = {
            let shards = self.shards.lock().await;
            shards.keys().copied().collect()
        };

        let mut dispatched_any = false;
        for shard in shard_keys {
            if self.try_dispatch_one(shard).await {
                dispatched_any = true;
            }
        }

        if !dispatched_any {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Per §4.3's dispatch-loop contract ("While the head's shard has
    /// getLockoutPeriod == 0 ... pop, call keyPool.get"): a shard whose
    /// entire enabled key set is still inside its rate-limit lockout
    /// must not be dispatched at all, so `get_lockout_period` is
    /// checked before ever calling `Pool::get` (§8 "Lockout correctness").
    async fn try_dispatch_one(&self, shard: Shard) -> bool {
        if self.pool.get_lockout_period(shard.service, shard.family).await != Duration::ZERO {
            return false;
        }
        let Some(key) = self.pool.get(shard.service, shard.family).await else {
            return false;
        };
        let mut shards = self.shards.lock().await;
        let Some(queue) = shards.get_mut(&shard) else {
            return false;
        };
        match queue.heap.pop() {
            Some(req) => {
                if req.respond.send(key).is_err() {
                    warn!("queued request dropped before dispatch");
                }
                true
            }
            None => false,
        }
    }

    async fn drain_with_rejection(&self) {
        let mut shards = self.shards.lock().await;
        for queue in shards.values_mut() {
            while let Some(req) = queue.heap.pop() {
                drop(req.respond);
            }
        }
    }
}
