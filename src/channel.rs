//! Inter-worker message channel.
//!
//! Each registered worker owns a bounded FIFO mailbox. Messages address a
//! single receiver or, when the receiver is absent, broadcast to every
//! mailbox except the sender's. Overflowing a mailbox drops the message and
//! bumps a counter instead of blocking the sender. A message older than its
//! time-to-live is dropped at send time and again discarded at receive time.
//! Correlated request/response exchange is layered on top of the mailboxes.

use crate::worker::WorkerId;
use crate::{hlog, hlog_debug, hlog_warn};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

/// Default bounded capacity of each worker mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1000;

/// Message delivery priority. Carried for consumers; mailbox order stays FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A message between workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: WorkerId,
    /// Absent means broadcast to every registered mailbox except the sender's.
    pub receiver: Option<WorkerId>,
    pub kind: String,
    pub content: Value,
    pub priority: MessagePriority,
    pub sent_at: DateTime<Utc>,
    /// Maximum age before the message is considered stale.
    pub ttl: Option<Duration>,
    pub requires_response: bool,
    /// Links a response to the request that prompted it.
    pub correlation_id: Option<Uuid>,
}

impl Message {
    /// Build a directed message.
    pub fn direct(sender: WorkerId, receiver: WorkerId, kind: &str, content: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            receiver: Some(receiver),
            kind: kind.to_string(),
            content,
            priority: MessagePriority::Normal,
            sent_at: Utc::now(),
            ttl: None,
            requires_response: false,
            correlation_id: None,
        }
    }

    /// Build a broadcast message (no receiver).
    pub fn broadcast(sender: WorkerId, kind: &str, content: Value) -> Self {
        Self {
            receiver: None,
            ..Self::direct(sender, sender, kind, content)
        }
    }

    /// Build a correlated request expecting a `{kind}_response` reply.
    pub fn request(
        sender: WorkerId,
        receiver: WorkerId,
        kind: &str,
        content: Value,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            requires_response: true,
            correlation_id: Some(correlation_id),
            ..Self::direct(sender, receiver, kind, content)
        }
    }

    /// Build the reply to a request, preserving its correlation id.
    pub fn response_to(request: &Message, sender: WorkerId, content: Value) -> Self {
        Self {
            correlation_id: request.correlation_id,
            ..Self::direct(sender, request.sender, &format!("{}_response", request.kind), content)
        }
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Whether the message has outlived its time-to-live at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => {
                let age = now
                    .signed_duration_since(self.sent_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age > ttl
            }
            None => false,
        }
    }
}

type HandlerFn = Arc<dyn Fn(Message) -> BoxFuture<'static, Option<Value>> + Send + Sync>;

/// A typed message callback registered with the channel.
///
/// Handlers run for the message kinds they list, highest priority first,
/// worker-scoped handlers before global ones.
#[derive(Clone)]
pub struct MessageHandler {
    kinds: Vec<String>,
    priority: i32,
    callback: HandlerFn,
}

impl MessageHandler {
    pub fn new<F, Fut>(kinds: &[&str], priority: i32, callback: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        Self {
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            priority,
            callback: Arc::new(move |message| Box::pin(callback(message))),
        }
    }

    fn handles(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }
}

/// Point-in-time channel statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub broadcast_messages: u64,
    pub registered_workers: usize,
    pub worker_handlers: usize,
    pub global_handlers: usize,
    pub running: bool,
}

struct Mailbox {
    tx: mpsc::Sender<Message>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Message>>>,
}

/// The message bus connecting workers, the orchestrator, and the collective.
///
/// Interior locks guard short critical sections only; receiving awaits on a
/// per-mailbox async mutex so concurrent receivers for the same worker
/// serialize instead of losing messages.
pub struct Channel {
    capacity: usize,
    running: AtomicBool,
    mailboxes: RwLock<HashMap<WorkerId, Mailbox>>,
    handlers: RwLock<HashMap<WorkerId, Vec<MessageHandler>>>,
    global_handlers: RwLock<Vec<MessageHandler>>,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    broadcasts: AtomicU64,
}

impl Channel {
    /// Create a channel whose mailboxes hold at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            running: AtomicBool::new(false),
            mailboxes: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            global_handlers: RwLock::new(Vec::new()),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
        }
    }

    /// Start accepting sends.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        hlog!("channel started");
    }

    /// Stop accepting sends. Registered mailboxes keep their contents.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        hlog!("channel stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Create a mailbox for a worker. Idempotent.
    pub fn register(&self, worker_id: WorkerId) {
        let mut mailboxes = self.mailboxes.write().expect("mailbox lock poisoned");
        mailboxes.entry(worker_id).or_insert_with(|| {
            hlog_debug!("channel registered worker {}", worker_id.short());
            let (tx, rx) = mpsc::channel(self.capacity);
            Mailbox {
                tx,
                rx: Arc::new(AsyncMutex::new(rx)),
            }
        });
    }

    /// Destroy a worker's mailbox and its scoped handlers.
    pub fn unregister(&self, worker_id: WorkerId) {
        self.mailboxes
            .write()
            .expect("mailbox lock poisoned")
            .remove(&worker_id);
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .remove(&worker_id);
        hlog_debug!("channel unregistered worker {}", worker_id.short());
    }

    /// Ids of all workers with a registered mailbox.
    pub fn registered(&self) -> Vec<WorkerId> {
        self.mailboxes
            .read()
            .expect("mailbox lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Deliver a message. Returns whether it reached at least one mailbox.
    ///
    /// A stopped channel, an expired message, an unknown receiver, and a
    /// full mailbox all fail delivery; the last two count as drops.
    pub fn send(&self, message: Message) -> bool {
        if !self.is_running() {
            return false;
        }
        self.sent.fetch_add(1, Ordering::Relaxed);

        if message.is_expired(Utc::now()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            hlog_warn!("message {} expired before delivery", message.id);
            return false;
        }

        match message.receiver {
            Some(receiver) => self.deliver(receiver, message),
            None => self.broadcast_message(message),
        }
    }

    fn deliver(&self, receiver: WorkerId, message: Message) -> bool {
        let tx = {
            let mailboxes = self.mailboxes.read().expect("mailbox lock poisoned");
            match mailboxes.get(&receiver) {
                Some(mailbox) => mailbox.tx.clone(),
                None => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    hlog_warn!("no mailbox for receiver {}", receiver.short());
                    return false;
                }
            }
        };

        match tx.try_send(message) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                hlog_warn!("mailbox full for worker {}, message dropped", receiver.short());
                false
            }
        }
    }

    fn broadcast_message(&self, message: Message) -> bool {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let targets: Vec<WorkerId> = {
            let mailboxes = self.mailboxes.read().expect("mailbox lock poisoned");
            mailboxes
                .keys()
                .copied()
                .filter(|id| *id != message.sender)
                .collect()
        };

        let mut delivered = 0usize;
        for target in targets {
            let mut copy = message.clone();
            copy.receiver = Some(target);
            if self.deliver(target, copy) {
                delivered += 1;
            }
        }
        hlog_debug!("broadcast from {} reached {} workers", message.sender.short(), delivered);
        delivered > 0
    }

    /// Wait up to `timeout` (indefinitely when None) for the worker's next
    /// mailbox entry. Returns None on timeout, on an unknown worker, and on
    /// receiving an already-expired message.
    pub async fn receive(&self, worker_id: WorkerId, timeout: Option<Duration>) -> Option<Message> {
        let rx = {
            let mailboxes = self.mailboxes.read().expect("mailbox lock poisoned");
            mailboxes.get(&worker_id)?.rx.clone()
        };

        let mut guard = rx.lock().await;
        let message = match timeout {
            Some(limit) => tokio::time::timeout(limit, guard.recv()).await.ok()??,
            None => guard.recv().await?,
        };
        drop(guard);

        if message.is_expired(Utc::now()) {
            hlog_warn!("received expired message {}, discarding", message.id);
            return None;
        }
        Some(message)
    }

    /// Send a correlated request and wait for the matching
    /// `{kind}_response` in the sender's own mailbox.
    ///
    /// Unrelated messages arriving in the window are discarded. Returns the
    /// response content, or None when the timeout elapses first.
    pub async fn request_response(
        &self,
        sender: WorkerId,
        receiver: WorkerId,
        kind: &str,
        content: Value,
        timeout: Duration,
    ) -> Option<Value> {
        let correlation_id = Uuid::new_v4();
        let request = Message::request(sender, receiver, kind, content, correlation_id);
        if !self.send(request) {
            return None;
        }

        let expected_kind = format!("{}_response", kind);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => {
                    hlog_warn!("request {} timed out waiting for {}", correlation_id, expected_kind);
                    return None;
                }
            };
            match self.receive(sender, Some(remaining)).await {
                Some(message)
                    if message.correlation_id == Some(correlation_id)
                        && message.kind == expected_kind =>
                {
                    return Some(message.content);
                }
                // Unrelated or expired message; keep waiting out the deadline.
                _ => continue,
            }
        }
    }

    /// Register a handler scoped to one worker's inbound messages.
    pub fn add_handler(&self, worker_id: WorkerId, handler: MessageHandler) {
        let mut handlers = self.handlers.write().expect("handler lock poisoned");
        let entry = handlers.entry(worker_id).or_default();
        entry.push(handler);
        entry.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Register a handler that applies to every worker.
    pub fn add_global_handler(&self, handler: MessageHandler) {
        let mut handlers = self.global_handlers.write().expect("handler lock poisoned");
        handlers.push(handler);
        handlers.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Route a message through the handler tables: the highest-priority
    /// worker-scoped handler for its kind, else the highest-priority global
    /// handler. Returns the handler's response, or None when nothing matches.
    pub async fn dispatch(&self, worker_id: WorkerId, message: Message) -> Option<Value> {
        let scoped = {
            let handlers = self.handlers.read().expect("handler lock poisoned");
            handlers
                .get(&worker_id)
                .and_then(|entries| entries.iter().find(|h| h.handles(&message.kind)).cloned())
        };
        if let Some(handler) = scoped {
            return (handler.callback)(message).await;
        }

        let global = {
            let handlers = self.global_handlers.read().expect("handler lock poisoned");
            handlers.iter().find(|h| h.handles(&message.kind)).cloned()
        };
        if let Some(handler) = global {
            return (handler.callback)(message).await;
        }

        hlog_debug!("no handler for message kind '{}'", message.kind);
        None
    }

    /// Number of messages waiting in a worker's mailbox.
    pub fn queue_len(&self, worker_id: WorkerId) -> usize {
        let mailboxes = self.mailboxes.read().expect("mailbox lock poisoned");
        match mailboxes.get(&worker_id) {
            Some(mailbox) => mailbox.tx.max_capacity() - mailbox.tx.capacity(),
            None => 0,
        }
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> ChannelStats {
        let worker_handlers = self
            .handlers
            .read()
            .expect("handler lock poisoned")
            .values()
            .map(|v| v.len())
            .sum();
        ChannelStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_delivered: self.delivered.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            broadcast_messages: self.broadcasts.load(Ordering::Relaxed),
            registered_workers: self
                .mailboxes
                .read()
                .expect("mailbox lock poisoned")
                .len(),
            worker_handlers,
            global_handlers: self
                .global_handlers
                .read()
                .expect("handler lock poisoned")
                .len(),
            running: self.is_running(),
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}
