use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use bootkeeper_process::{ConnectionStatus, ObserverId, OutputEvent, SlotId, SupervisorEvent};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::{config::CONNECT_REPLAY_LINES, output_buffer::OutputBuffer};

pub(crate) type SharedOutput = Arc<Mutex<OutputBuffer>>;

/// Fans output events out to every connected observer.
///
/// Each observer owns an unbounded queue, so publishing never waits on a slow
/// observer and never drops its events. Pacing a slow consumer is left to
/// whatever transport drains the subscription. A closed queue unregisters its
/// observer.
#[derive(Clone)]
pub struct Broadcaster {
    observers: Arc<RwLock<HashMap<ObserverId, mpsc::UnboundedSender<SupervisorEvent>>>>,
    outputs: Arc<BTreeMap<SlotId, SharedOutput>>,
}

impl Broadcaster {
    pub(crate) fn new(outputs: BTreeMap<SlotId, SharedOutput>) -> Self {
        Self {
            observers: Arc::new(RwLock::new(HashMap::new())),
            outputs: Arc::new(outputs),
        }
    }

    pub async fn publish(&self, event: OutputEvent) {
        let mut closed = Vec::new();
        {
            let observers = self.observers.read().await;
            for (id, tx) in observers.iter() {
                if tx.send(SupervisorEvent::Output(event.clone())).is_err() {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut observers = self.observers.write().await;
            for id in closed {
                observers.remove(&id);
                tracing::info!(observer = %id, remaining = observers.len(), "observer disconnected");
            }
        }
    }

    /// Registers a new observer. The subscription starts with a connection
    /// status event followed by the last few lines of every slot in ascending
    /// slot order, then continues with live events.
    pub async fn connect(&self) -> Subscription {
        let id = ObserverId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        // Register before the snapshot so no line appended after it is lost;
        // lines already covered by the snapshot are filtered by `cursors`.
        let count = {
            let mut observers = self.observers.write().await;
            observers.insert(id, tx);
            observers.len()
        };

        let mut pending = VecDeque::new();
        pending.push_back(SupervisorEvent::Connection(ConnectionStatus::Connected {
            observer: id,
            timestamp: Utc::now(),
        }));

        let mut cursors = BTreeMap::new();
        for (slot, output) in self.outputs.iter() {
            let buf = output.lock().await;
            cursors.insert(*slot, buf.last_seq());
            pending.extend(
                buf.tail_events(CONNECT_REPLAY_LINES)
                    .into_iter()
                    .map(SupervisorEvent::Output),
            );
        }

        tracing::info!(observer = %id, observers = count, "observer connected");

        Subscription {
            id,
            pending,
            cursors,
            rx,
        }
    }

    pub async fn disconnect(&self, id: ObserverId) -> bool {
        let removed = self.observers.write().await.remove(&id).is_some();
        if removed {
            tracing::info!(observer = %id, "observer disconnected");
        }
        removed
    }

    /// Tells every observer the supervisor is going away and drops them.
    pub async fn shutdown(&self) {
        let mut observers = self.observers.write().await;
        for (id, tx) in observers.drain() {
            let _ = tx.send(SupervisorEvent::Connection(
                ConnectionStatus::Disconnected {
                    observer: id,
                    timestamp: Utc::now(),
                },
            ));
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }
}

/// Live event stream of one observer. Dropping it disconnects the observer.
#[derive(Debug)]
pub struct Subscription {
    id: ObserverId,
    pending: VecDeque<SupervisorEvent>,
    cursors: BTreeMap<SlotId, u64>,
    rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next event; `None` once the supervisor dropped this observer.
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        loop {
            let ev = self.rx.recv().await?;
            if !self.already_replayed(&ev) {
                return Some(ev);
            }
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SupervisorEvent> {
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        loop {
            let ev = self.rx.try_recv().ok()?;
            if !self.already_replayed(&ev) {
                return Some(ev);
            }
        }
    }

    fn already_replayed(&self, ev: &SupervisorEvent) -> bool {
        match ev {
            SupervisorEvent::Output(out) => self
                .cursors
                .get(&out.slot)
                .is_some_and(|cursor| out.seq <= *cursor),
            SupervisorEvent::Connection(_) => false,
        }
    }
}
