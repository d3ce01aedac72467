//! Inbound message batching
//!
//! Messages are queued in fixed-capacity batches and only become visible when
//! a periodic sweep finds their batch old enough. Every flush merges into the
//! published list, drops duplicate ids and re-sorts by timestamp, so observers
//! never see a partially filled batch or an unsorted list.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use supportdesk_shared::{Message, UserId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::api_client::{ApiResult, HistorySource};

/// Default messages per batch
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default sweep period and minimum batch age
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Display order of the published list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageOrder {
    /// Most recent message first
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub order: MessageOrder,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            order: MessageOrder::default(),
        }
    }
}

struct Batch {
    messages: Vec<Message>,
    created_at: Instant,
}

struct BatchState {
    pending: VecDeque<Batch>,
    published: Vec<Message>,
    is_loading: bool,
    has_more: bool,
}

/// Buffers inbound messages and publishes them in sorted batches
pub struct MessageBatcher {
    config: BatchConfig,
    state: Mutex<BatchState>,
    published_tx: watch::Sender<Arc<[Message]>>,
}

impl Default for MessageBatcher {
    fn default() -> Self {
        Self::new(BatchConfig::default())
    }
}

impl MessageBatcher {
    /// `batch_size` is clamped to at least one message
    pub fn new(mut config: BatchConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        let empty: Arc<[Message]> = Arc::from(Vec::new());
        let (published_tx, _) = watch::channel(empty);
        Self {
            config,
            state: Mutex::new(BatchState {
                pending: VecDeque::new(),
                published: Vec::new(),
                is_loading: false,
                has_more: true,
            }),
            published_tx,
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue one message into the open batch
    pub fn add_message(&self, message: Message) {
        let mut state = self.lock();
        let needs_batch = state
            .pending
            .back()
            .map_or(true, |batch| batch.messages.len() >= self.config.batch_size);
        if needs_batch {
            state.pending.push_back(Batch {
                messages: Vec::with_capacity(self.config.batch_size),
                created_at: Instant::now(),
            });
        }
        if let Some(batch) = state.pending.back_mut() {
            batch.messages.push(message);
        }
    }

    /// Queue a list of messages as new batches of at most `batch_size`
    pub fn add_messages(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }

        let created_at = Instant::now();
        let mut state = self.lock();
        let mut messages = messages.into_iter().peekable();
        while messages.peek().is_some() {
            let chunk: Vec<Message> = messages.by_ref().take(self.config.batch_size).collect();
            state.pending.push_back(Batch {
                messages: chunk,
                created_at,
            });
        }
    }

    /// Publish every batch at least `batch_interval` old
    ///
    /// Returns the number of messages taken out of the queue.
    pub fn flush_due(&self) -> usize {
        let now = Instant::now();
        let interval = self.config.batch_interval;
        self.flush_where(|batch| now.duration_since(batch.created_at) >= interval)
    }

    /// Publish every queued batch regardless of age
    pub fn flush_all(&self) -> usize {
        self.flush_where(|_| true)
    }

    fn flush_where(&self, due: impl Fn(&Batch) -> bool) -> usize {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return 0;
        }

        let (ready, waiting): (VecDeque<Batch>, VecDeque<Batch>) =
            state.pending.drain(..).partition(|batch| due(batch));
        state.pending = waiting;

        let flushed: usize = ready.iter().map(|batch| batch.messages.len()).sum();
        if flushed == 0 {
            return 0;
        }

        for batch in ready {
            state.published.extend(batch.messages);
        }

        // First occurrence wins so a message keeps its read flag
        let mut seen = HashSet::new();
        state.published.retain(|m| seen.insert(m.id.clone()));

        match self.config.order {
            MessageOrder::NewestFirst => state
                .published
                .sort_by(|a, b| b.timestamp.cmp(&a.timestamp)),
            MessageOrder::OldestFirst => state
                .published
                .sort_by(|a, b| a.timestamp.cmp(&b.timestamp)),
        }

        self.publish(&state);
        tracing::trace!(
            flushed,
            total = state.published.len(),
            pending_batches = state.pending.len(),
            "Flushed message batches"
        );
        flushed
    }

    fn publish(&self, state: &BatchState) {
        self.published_tx
            .send_replace(Arc::from(state.published.as_slice()));
    }

    /// Run `flush_due` every `batch_interval` until aborted or the batcher is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let batcher = Arc::downgrade(self);
        let period = self.config.batch_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(batcher) = batcher.upgrade() else {
                    break;
                };
                batcher.flush_due();
            }
        })
    }

    /// Fetch the page older than the oldest known message
    ///
    /// Does nothing while a load is running or once the source has run dry.
    /// Returns the number of messages fetched.
    pub async fn load_more_messages(
        &self,
        source: &dyn HistorySource,
        user: &UserId,
    ) -> ApiResult<usize> {
        let before = {
            let mut state = self.lock();
            if state.is_loading || !state.has_more {
                return Ok(0);
            }
            state.is_loading = true;

            let oldest = state
                .published
                .iter()
                .chain(state.pending.iter().flat_map(|batch| batch.messages.iter()))
                .map(|m| m.timestamp)
                .min();
            oldest
        };

        let page = match source
            .fetch_history(user, before, self.config.batch_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.lock().is_loading = false;
                tracing::warn!(user_id = %user, error = %e, "Failed to load chat history");
                return Err(e);
            }
        };

        let fetched = page.len();
        self.add_messages(page);
        self.flush_all();

        let mut state = self.lock();
        state.has_more = fetched >= self.config.batch_size;
        state.is_loading = false;

        tracing::debug!(user_id = %user, fetched, has_more = state.has_more, "Loaded chat history");
        Ok(fetched)
    }

    /// Forget everything, published and queued
    pub fn clear_messages(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.published.clear();
        state.has_more = true;
        self.publish(&state);
    }

    /// Flag a published message as read; false if it is not published
    pub fn mark_read(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(message) = state.published.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        if message.read {
            return true;
        }
        message.read = true;
        self.publish(&state);
        true
    }

    /// Current published list
    pub fn messages(&self) -> Arc<[Message]> {
        self.published_tx.borrow().clone()
    }

    /// Receive every new published list
    pub fn subscribe(&self) -> watch::Receiver<Arc<[Message]>> {
        self.published_tx.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().is_loading
    }

    pub fn has_more(&self) -> bool {
        self.lock().has_more
    }

    pub fn pending_batch_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending_message_count(&self) -> usize {
        self.lock()
            .pending
            .iter()
            .map(|batch| batch.messages.len())
            .sum()
    }
}
