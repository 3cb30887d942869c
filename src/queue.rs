//! Outbound message queue for one circuit.
//!
//! Any thread may enqueue without blocking; a single send task drains the queue
//! in batches so only one write is ever in flight. Event updates can be enqueued
//! with a coalescing key, which lets a newer update overwrite an older one still
//! waiting in the queue once the depth passes its high-water mark.

use std::{collections::VecDeque, time::Duration};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::messages::Message;

#[derive(Debug)]
struct Entry {
    key: Option<u64>,
    message: Message,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    closed: bool,
}

#[derive(Debug)]
pub struct SendQueue {
    state: Mutex<QueueState>,
    /// Wakes the send task
    ready: Notify,
    /// Wakes publishers waiting for the queue to drain
    drained: Condvar,
    high_water: usize,
}

impl Default for SendQueue {
    fn default() -> Self {
        SendQueue::new(usize::MAX)
    }
}

impl SendQueue {
    pub fn new(high_water: usize) -> Self {
        SendQueue {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            drained: Condvar::new(),
            high_water,
        }
    }

    /// Append a message. Returns false if the queue is closed.
    pub fn push(&self, message: Message) -> bool {
        self.push_all([message])
    }

    pub fn push_all(&self, messages: impl IntoIterator<Item = Message>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state
            .entries
            .extend(messages.into_iter().map(|message| Entry { key: None, message }));
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Append a message, or above high water replace the newest queued message with the same key.
    ///
    /// The replacement keeps the position of the message it replaces, so no
    /// older message for the key can follow it.
    pub fn push_replacing(&self, key: u64, message: Message) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.entries.len() >= self.high_water
            && let Some(entry) = state.entries.iter_mut().rfind(|e| e.key == Some(key))
        {
            entry.message = message;
            return true;
        }
        state.entries.push_back(Entry {
            key: Some(key),
            message,
        });
        drop(state);
        self.ready.notify_one();
        true
    }

    pub fn depth(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_above_high_water(&self) -> bool {
        self.depth() >= self.high_water
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Block the calling thread until the depth drops below high water.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_below_high_water(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        !self
            .drained
            .wait_while_for(
                &mut state,
                |s| !s.closed && s.entries.len() >= self.high_water,
                timeout,
            )
            .timed_out()
    }

    /// Stop accepting messages. Whatever is queued is still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
        self.drained.notify_all();
    }

    /// Take everything queued, waiting if empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn next_batch(&self) -> Option<Vec<Message>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.entries.is_empty() {
                    let batch = state.entries.drain(..).map(|e| e.message).collect();
                    drop(state);
                    self.drained.notify_all();
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Take everything queued without waiting
    pub fn drain(&self) -> Vec<Message> {
        let batch = self.state.lock().entries.drain(..).map(|e| e.message).collect();
        self.drained.notify_all();
        batch
    }
}
