use std::{collections::HashMap, sync::Arc, time::Duration};

use backend_core::{
    BackendError, MessageKind, MessageRecord, ProtocolClient, TimelineBuffer, TimelineEvent,
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{bounded, manager::DEFAULT_PROTOCOL_TIMEOUT};

pub const DEFAULT_TIMELINE_LIMIT: u16 = 30;
pub const DEFAULT_TIMELINE_MAX_ITEMS: usize = 1_200;

/// Called once for every live message appended to a room's timeline.
pub type MessageCallback = Arc<dyn Fn(MessageRecord) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TimelineConfig {
    /// Snapshot size requested from the protocol client.
    pub fetch_limit: u16,
    pub max_items: usize,
    pub call_timeout: Duration,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            fetch_limit: DEFAULT_TIMELINE_LIMIT,
            max_items: DEFAULT_TIMELINE_MAX_ITEMS,
            call_timeout: DEFAULT_PROTOCOL_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct RunningListener {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningListener {
    fn is_live(&self) -> bool {
        !self.stop.is_cancelled() && !self.task.is_finished()
    }
}

/// Forget listeners whose owner dropped them or whose task already exited.
fn prune(listeners: &mut HashMap<String, RunningListener>) {
    listeners.retain(|room_id, listener| {
        let live = listener.is_live();
        if !live {
            debug!(room_id = %room_id, "pruning stopped live listener");
        }
        live
    });
}

/// At most one live listener per room, shared by every synchronizer.
#[derive(Debug, Clone, Default)]
pub struct LiveListeners {
    inner: Arc<Mutex<HashMap<String, RunningListener>>>,
}

impl LiveListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the listener for `room_id`, tearing down any previous one first.
    ///
    /// The old task has exited before `spawn` runs.
    async fn install(
        &self,
        room_id: &str,
        spawn: impl FnOnce(CancellationToken) -> JoinHandle<()>,
    ) -> CancellationToken {
        let mut listeners = self.inner.lock().await;
        prune(&mut listeners);
        if let Some(previous) = listeners.remove(room_id) {
            debug!(room_id, "replacing live listener");
            previous.stop.cancel();
            let _ = previous.task.await;
        }
        let stop = CancellationToken::new();
        let task = spawn(stop.child_token());
        listeners.insert(
            room_id.to_owned(),
            RunningListener {
                stop: stop.clone(),
                task,
            },
        );
        stop
    }

    /// Stop the listener for `room_id`; returns whether one was running.
    pub async fn remove(&self, room_id: &str) -> bool {
        let previous = self.inner.lock().await.remove(room_id);
        match previous {
            Some(previous) => {
                previous.stop.cancel();
                let _ = previous.task.await;
                debug!(room_id, "live listener stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, room_id: &str) -> bool {
        let mut listeners = self.inner.lock().await;
        prune(&mut listeners);
        listeners.contains_key(room_id)
    }

    pub async fn active_count(&self) -> usize {
        let mut listeners = self.inner.lock().await;
        prune(&mut listeners);
        listeners.len()
    }

    /// Stop every listener; used on logout or teardown.
    pub async fn clear(&self) {
        let drained: Vec<RunningListener> = self
            .inner
            .lock()
            .await
            .drain()
            .map(|(_, listener)| listener)
            .collect();
        for listener in drained {
            listener.stop.cancel();
            let _ = listener.task.await;
        }
    }
}

/// Merges one room's snapshot with the live stream into an ordered, deduplicated timeline.
pub struct TimelineSynchronizer {
    room_id: String,
    protocol: Arc<dyn ProtocolClient>,
    listeners: LiveListeners,
    config: TimelineConfig,
    buffer: Arc<Mutex<TimelineBuffer>>,
    // Room-scoped queue opened at construction; holds everything the snapshot may have missed.
    pending: Mutex<Option<mpsc::UnboundedReceiver<TimelineEvent>>>,
    listener_stop: Mutex<Option<CancellationToken>>,
}

impl TimelineSynchronizer {
    pub fn new(
        room_id: impl Into<String>,
        protocol: Arc<dyn ProtocolClient>,
        listeners: LiveListeners,
        config: TimelineConfig,
    ) -> Self {
        let room_id = room_id.into();
        let pending = protocol.subscribe_room(&room_id);
        Self {
            room_id,
            buffer: Arc::new(Mutex::new(TimelineBuffer::new(config.max_items))),
            protocol,
            listeners,
            config,
            pending: Mutex::new(Some(pending)),
            listener_stop: Mutex::new(None),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Fetch the room snapshot and return the timeline oldest first.
    ///
    /// The protocol snapshot is newest first; it is reversed, not re-sorted,
    /// so server order survives for equal timestamps. Live messages queued
    /// since construction follow the snapshot, minus those it already holds.
    pub async fn load_initial(&self) -> Result<Vec<MessageRecord>, BackendError> {
        let events = bounded(
            "fetch timeline",
            self.config.call_timeout,
            self.protocol
                .fetch_timeline(&self.room_id, self.config.fetch_limit),
        )
        .await?;

        let fetched = events.len();
        let snapshot: Vec<MessageRecord> = events
            .iter()
            .rev()
            .filter_map(|event| event.to_message())
            .collect();

        let mut buffer = self.buffer.lock().await;
        buffer.load_snapshot(snapshot);
        let mut queued = 0_usize;
        if let Some(pending) = self.pending.lock().await.as_mut() {
            while let Ok(event) = pending.try_recv() {
                if let Some(record) = event.to_message()
                    && buffer.append(record)
                {
                    queued += 1;
                }
            }
        }
        debug!(
            room_id = %self.room_id,
            fetched,
            queued,
            messages = buffer.len(),
            "timeline loaded"
        );
        Ok(buffer.items().to_vec())
    }

    /// Start delivering this room's live messages to `on_message`.
    ///
    /// Replaces any listener already running for the room.
    pub async fn subscribe_live(&self, on_message: MessageCallback) {
        let receiver = match self.pending.lock().await.take() {
            Some(receiver) => receiver,
            None => self.protocol.subscribe_room(&self.room_id),
        };
        let room_id = self.room_id.clone();
        let buffer = Arc::clone(&self.buffer);

        let stop = self
            .listeners
            .install(&self.room_id, move |stop| {
                tokio::spawn(run_listener(room_id, receiver, buffer, on_message, stop))
            })
            .await;
        *self.listener_stop.lock().await = Some(stop);
        info!(room_id = %self.room_id, "live timeline subscribed");
    }

    /// Stop live delivery for this room.
    pub async fn unsubscribe(&self) {
        let own = self.listener_stop.lock().await.take();
        // Only remove the registry entry if it is still ours.
        if let Some(own) = own
            && !own.is_cancelled()
        {
            self.listeners.remove(&self.room_id).await;
        }
    }

    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.buffer.lock().await.items().to_vec()
    }

    /// Post a plain-text message; its echo arrives over the live stream.
    pub async fn send_text(&self, body: &str) -> Result<String, BackendError> {
        let event_id = bounded(
            "send message",
            self.config.call_timeout,
            self.protocol
                .send_message(&self.room_id, body, MessageKind::Text),
        )
        .await?;
        debug!(room_id = %self.room_id, event_id = %event_id, "message sent");
        Ok(event_id)
    }
}

impl Drop for TimelineSynchronizer {
    fn drop(&mut self) {
        if let Some(stop) = self.listener_stop.get_mut().take() {
            stop.cancel();
        }
    }
}

async fn run_listener(
    room_id: String,
    mut receiver: mpsc::UnboundedReceiver<TimelineEvent>,
    buffer: Arc<Mutex<TimelineBuffer>>,
    on_message: MessageCallback,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = receiver.recv() => event,
        };

        let Some(event) = event else {
            debug!(room_id = %room_id, "live room feed closed");
            break;
        };
        let Some(record) = event.to_message() else {
            continue;
        };
        let appended = buffer.lock().await.append(record.clone());
        if appended {
            on_message(record);
        }
    }
}

/// The currently selected room's timeline; switching rooms tears down the old listener first.
pub struct TimelineSelection {
    listeners: LiveListeners,
    config: TimelineConfig,
    current: Option<TimelineSynchronizer>,
}

impl TimelineSelection {
    pub fn new(listeners: LiveListeners, config: TimelineConfig) -> Self {
        Self {
            listeners,
            config,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&TimelineSynchronizer> {
        self.current.as_ref()
    }

    /// Select `room_id`: load its snapshot and subscribe to live messages.
    pub async fn select(
        &mut self,
        protocol: Arc<dyn ProtocolClient>,
        room_id: &str,
        on_message: MessageCallback,
    ) -> Result<Vec<MessageRecord>, BackendError> {
        self.deselect().await;

        let synchronizer = TimelineSynchronizer::new(
            room_id,
            protocol,
            self.listeners.clone(),
            self.config.clone(),
        );
        let initial = synchronizer.load_initial().await?;
        synchronizer.subscribe_live(on_message).await;
        self.current = Some(synchronizer);
        Ok(initial)
    }

    pub async fn deselect(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.unsubscribe().await;
            debug!(room_id = %previous.room_id(), "room deselected");
        }
    }
}
