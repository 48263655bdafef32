//! State shared by both transports: lifecycle, handler registries, the
//! dispatch gate, the outbound queue and counters.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cachemesh_protocol::{Message, Node, NodeId, ReceivedMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    ChannelError, ChannelStats, DispatchContext, HandlerId, MessageHandler, PresenceHandler,
    Result, TransportKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Starting,
    Running,
    Closed,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub messages_queued: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub send_rejected: AtomicU64,
    pub handler_failures: AtomicU64,
    pub peers_joined: AtomicU64,
    pub peers_left: AtomicU64,
    pub dial_failures: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) struct ChannelCore {
    transport: TransportKind,
    lifecycle: Mutex<Lifecycle>,
    local: RwLock<Option<Node>>,
    message_handlers: Mutex<Vec<(HandlerId, Arc<dyn MessageHandler>)>>,
    presence_handlers: Mutex<Vec<(HandlerId, Arc<dyn PresenceHandler>)>>,
    next_handler_id: AtomicU64,
    /// Open while the channel may invoke handlers. Dispatch holds a read
    /// guard for the duration of the handler calls; close takes the write
    /// guard, so once close returns no handler is running or will run.
    gate: RwLock<bool>,
    outbound: RwLock<Option<mpsc::Sender<Message>>>,
    queue_capacity: usize,
    pub counters: Counters,
    pub cancel: CancellationToken,
}

impl ChannelCore {
    pub fn new(transport: TransportKind, queue_capacity: usize) -> Self {
        Self {
            transport,
            lifecycle: Mutex::new(Lifecycle::Created),
            local: RwLock::new(None),
            message_handlers: Mutex::new(Vec::new()),
            presence_handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            gate: RwLock::new(false),
            outbound: RwLock::new(None),
            queue_capacity: queue_capacity.max(1),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Move to `Starting` and create the outbound queue. The receiver goes
    /// to the transport's sender task.
    pub fn begin_init(&self) -> Result<mpsc::Receiver<Message>> {
        let mut state = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            Lifecycle::Created => {}
            Lifecycle::Closed => return Err(ChannelError::Closed),
            Lifecycle::Starting | Lifecycle::Running => {
                return Err(ChannelError::AlreadyInitialized)
            }
        }
        *state = Lifecycle::Starting;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        *self.outbound.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(rx)
    }

    /// Transport bound: open the dispatch gate.
    pub fn finish_init(&self, local: Node) {
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = Some(local);
        *self.gate.write().unwrap_or_else(|e| e.into_inner()) = true;
        let mut state = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *state == Lifecycle::Starting {
            *state = Lifecycle::Running;
        }
    }

    /// Binding failed: back to `Created` so init may be retried.
    pub fn abort_init(&self) {
        self.outbound
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut state = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *state == Lifecycle::Starting {
            *state = Lifecycle::Created;
        }
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) == Lifecycle::Running
    }

    pub fn is_closed(&self) -> bool {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) == Lifecycle::Closed
    }

    /// Returns false if the channel was already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if *state == Lifecycle::Closed {
                return false;
            }
            *state = Lifecycle::Closed;
        }
        // Waits for in-flight handler calls to finish
        *self.gate.write().unwrap_or_else(|e| e.into_inner()) = false;
        self.cancel.cancel();
        self.outbound
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        true
    }

    pub fn local_node(&self) -> Option<Node> {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.local_node().map(|n| n.id)
    }

    // ------------------------------------------------------------------
    // Handler registries
    // ------------------------------------------------------------------

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) -> HandlerId {
        let id = self.next_id();
        self.message_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        id
    }

    pub fn unregister_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .message_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn register_presence_handler(&self, handler: Arc<dyn PresenceHandler>) -> HandlerId {
        let id = self.next_id();
        self.presence_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        id
    }

    pub fn unregister_presence_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .presence_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Hand an inbound message to every registered handler, in
    /// registration order. Failures and panics are logged and counted.
    pub fn dispatch_message(&self, message: &ReceivedMessage) {
        bump(&self.counters.messages_received);

        let gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        if !*gate {
            return;
        }
        let Some(local) = self.local_id() else {
            return;
        };
        let ctx = DispatchContext {
            local,
            origin: message.sender().id,
            transport: self.transport,
        };
        let handlers = self
            .message_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_message(&ctx, message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    bump(&self.counters.handler_failures);
                    tracing::warn!(
                        handler = %id,
                        command = %message.command(),
                        sender = %message.sender(),
                        "message handler failed: {e}"
                    );
                }
                Err(_) => {
                    bump(&self.counters.handler_failures);
                    tracing::error!(
                        handler = %id,
                        command = %message.command(),
                        sender = %message.sender(),
                        "message handler panicked"
                    );
                }
            }
        }
    }

    pub fn node_entered(&self, node: &Node) {
        bump(&self.counters.peers_joined);
        tracing::info!(transport = %self.transport, peer = %node, "peer joined");
        self.dispatch_presence(node, true);
    }

    pub fn node_left(&self, node: &Node) {
        bump(&self.counters.peers_left);
        tracing::info!(transport = %self.transport, peer = %node, "peer left");
        self.dispatch_presence(node, false);
    }

    fn dispatch_presence(&self, node: &Node, entered: bool) {
        let gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        if !*gate {
            return;
        }
        let handlers = self
            .presence_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, handler) in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                if entered {
                    handler.node_entered(node)
                } else {
                    handler.node_left(node)
                }
            }));
            if result.is_err() {
                bump(&self.counters.handler_failures);
                tracing::error!(handler = %id, peer = %node, "presence handler panicked");
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound queue
    // ------------------------------------------------------------------

    fn not_running(&self) -> ChannelError {
        if self.is_closed() {
            ChannelError::Closed
        } else {
            ChannelError::NotRunning
        }
    }

    pub fn enqueue(&self, message: Message) -> Result<()> {
        let outbound = self.outbound.read().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = outbound.as_ref() else {
            return Err(self.not_running());
        };
        match tx.try_send(message) {
            Ok(()) => {
                bump(&self.counters.messages_queued);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                bump(&self.counters.send_rejected);
                Err(ChannelError::QueueFull {
                    capacity: self.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    pub async fn enqueue_timeout(&self, message: Message, timeout: Duration) -> Result<()> {
        let tx = {
            let outbound = self.outbound.read().unwrap_or_else(|e| e.into_inner());
            match outbound.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(self.not_running()),
            }
        };
        match tx.send_timeout(message, timeout).await {
            Ok(()) => {
                bump(&self.counters.messages_queued);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                bump(&self.counters.send_rejected);
                Err(ChannelError::SendTimeout(timeout))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Messages waiting in the channel-wide queue.
    pub fn queued(&self) -> usize {
        self.outbound
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn stats(&self, queue_size: usize) -> ChannelStats {
        let c = &self.counters;
        ChannelStats {
            messages_queued: c.messages_queued.load(Ordering::Relaxed),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            messages_dropped: c.messages_dropped.load(Ordering::Relaxed),
            send_rejected: c.send_rejected.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            peers_joined: c.peers_joined.load(Ordering::Relaxed),
            peers_left: c.peers_left.load(Ordering::Relaxed),
            dial_failures: c.dial_failures.load(Ordering::Relaxed),
            queue_size,
        }
    }
}
