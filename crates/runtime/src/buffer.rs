use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use outreach_core::config::BufferConfig;
use outreach_core::domain::conversation::{BufferedMessage, ConversationKey};

/// Receives one flushed batch per conversation. Errors are logged and the
/// batch is dropped; the buffer never retries.
#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn flush(
        &self,
        key: ConversationKey,
        messages: Vec<BufferedMessage>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("message buffer is shutting down")]
    ShuttingDown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferSettings {
    pub debounce_min: Duration,
    pub debounce_max: Duration,
    pub max_messages: usize,
    pub max_wait: Duration,
}

impl BufferSettings {
    /// Fixed inactivity window, mostly useful in tests.
    pub fn fixed(debounce: Duration, max_messages: usize, max_wait: Duration) -> Self {
        Self { debounce_min: debounce, debounce_max: debounce, max_messages, max_wait }
    }

    fn sample_debounce(&self) -> Duration {
        if self.debounce_max <= self.debounce_min {
            return self.debounce_min;
        }
        rand::thread_rng().gen_range(self.debounce_min..=self.debounce_max)
    }
}

impl From<&BufferConfig> for BufferSettings {
    fn from(config: &BufferConfig) -> Self {
        let (debounce_min, debounce_max) = config.debounce_window();
        Self {
            debounce_min,
            debounce_max,
            max_messages: config.max_messages.max(1),
            max_wait: config.max_wait(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushReason {
    Inactivity,
    MaxWait,
    MaxMessages,
    Shutdown,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Inactivity => "inactivity",
            Self::MaxWait => "max_wait",
            Self::MaxMessages => "max_messages",
            Self::Shutdown => "shutdown",
        }
    }
}

struct KeyBuffer {
    epoch: u64,
    messages: Vec<BufferedMessage>,
    opened_at: Instant,
    deadline: Instant,
    capped: bool,
}

impl KeyBuffer {
    fn reschedule(&mut self, now: Instant, debounce: Duration, max_wait: Duration) {
        let quiet_deadline = now + debounce;
        let hard_deadline = self.opened_at + max_wait;
        self.capped = hard_deadline <= quiet_deadline;
        self.deadline = quiet_deadline.min(hard_deadline);
    }
}

#[derive(Default)]
struct BufferState {
    buffers: HashMap<ConversationKey, KeyBuffer>,
    next_epoch: u64,
    closed: bool,
}

struct Inner {
    settings: BufferSettings,
    handler: Arc<dyn FlushHandler>,
    state: Mutex<BufferState>,
    flushes: TaskTracker,
}

/// Per-conversation debounce buffer.
///
/// Each conversation key owns at most one open buffer. The buffer flushes
/// when no message arrived for a randomized quiet window, when `max_wait`
/// elapsed since its first message, or when it holds `max_messages`. Keys
/// never share state, so a slow or failing flush on one key does not delay
/// another. A message that arrives while a flush is in flight opens a new
/// buffer.
#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<Inner>,
}

impl MessageBuffer {
    pub fn new(settings: BufferSettings, handler: Arc<dyn FlushHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                handler,
                state: Mutex::new(BufferState::default()),
                flushes: TaskTracker::new(),
            }),
        }
    }

    /// Appends a message to the key's buffer, opening one if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_message(
        &self,
        key: ConversationKey,
        message: BufferedMessage,
    ) -> Result<(), BufferError> {
        let now = Instant::now();
        let debounce = self.inner.settings.sample_debounce();
        let max_wait = self.inner.settings.max_wait;

        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(BufferError::ShuttingDown);
        }

        let next_epoch = state.next_epoch;
        let (len, opened_epoch) = match state.buffers.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let buffer = entry.get_mut();
                buffer.messages.push(message);
                buffer.reschedule(now, debounce, max_wait);
                (buffer.messages.len(), None)
            }
            Entry::Vacant(entry) => {
                let mut buffer = KeyBuffer {
                    epoch: next_epoch,
                    messages: vec![message],
                    opened_at: now,
                    deadline: now,
                    capped: false,
                };
                buffer.reschedule(now, debounce, max_wait);
                entry.insert(buffer);
                (1, Some(next_epoch))
            }
        };
        if opened_epoch.is_some() {
            state.next_epoch += 1;
        }

        if len >= self.inner.settings.max_messages {
            let full = state.buffers.remove(&key);
            drop(state);
            if let Some(full) = full {
                self.inner.dispatch(key, full.messages, FlushReason::MaxMessages);
            }
            return Ok(());
        }
        drop(state);

        debug!(
            event_name = "runtime.buffer.message_buffered",
            conversation_key = %key,
            buffered = len,
            "message buffered"
        );

        if let Some(epoch) = opened_epoch {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(run_timer(inner, key, epoch));
        }
        Ok(())
    }

    pub fn pending_keys(&self) -> Vec<ConversationKey> {
        self.inner.lock_state().buffers.keys().cloned().collect()
    }

    pub fn buffered_len(&self, key: &ConversationKey) -> usize {
        self.inner.lock_state().buffers.get(key).map_or(0, |buffer| buffer.messages.len())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Rejects further messages, flushes every open buffer and waits for all
    /// in-flight flush callbacks to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            state.buffers.drain().collect()
        };

        info!(
            event_name = "runtime.buffer.shutdown",
            correlation_id = "shutdown",
            open_buffers = drained.len(),
            "flushing open buffers"
        );

        for (key, buffer) in drained {
            self.inner.dispatch(key, buffer.messages, FlushReason::Shutdown);
        }

        self.inner.flushes.close();
        self.inner.flushes.wait().await;
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, key: ConversationKey, messages: Vec<BufferedMessage>, reason: FlushReason) {
        let handler = Arc::clone(&self.handler);
        self.flushes.spawn(async move {
            let count = messages.len();
            info!(
                event_name = "runtime.buffer.flushed",
                conversation_key = %key,
                messages = count,
                reason = reason.as_str(),
                "flushing conversation buffer"
            );

            let flush_key = key.clone();
            let outcome =
                tokio::spawn(async move { handler.flush(flush_key, messages).await }).await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(
                    event_name = "runtime.buffer.flush_failed",
                    conversation_key = %key,
                    messages = count,
                    error = %error,
                    "flush handler failed; batch dropped"
                ),
                Err(join_error) => warn!(
                    event_name = "runtime.buffer.flush_panicked",
                    conversation_key = %key,
                    messages = count,
                    error = %join_error,
                    "flush handler panicked; batch dropped"
                ),
            }
        });
    }
}

async fn run_timer(inner: Arc<Inner>, key: ConversationKey, epoch: u64) {
    loop {
        let deadline = {
            let state = inner.lock_state();
            match state.buffers.get(&key) {
                Some(buffer) if buffer.epoch == epoch => buffer.deadline,
                _ => return,
            }
        };

        tokio::time::sleep_until(deadline).await;

        let expired = {
            let mut state = inner.lock_state();
            let due = match state.buffers.get(&key) {
                Some(buffer) if buffer.epoch == epoch => buffer.deadline <= Instant::now(),
                _ => return,
            };
            if due {
                state.buffers.remove(&key)
            } else {
                None
            }
        };

        if let Some(buffer) = expired {
            let reason = if buffer.capped { FlushReason::MaxWait } else { FlushReason::Inactivity };
            inner.dispatch(key, buffer.messages, reason);
            return;
        }
    }
}
