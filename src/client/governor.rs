//! Bounded-rate release of disconnected channels.
//!
//! Losing one circuit can disconnect thousands of channels at once. Instead of
//! calling every listener and re-searching every name in one burst, channels are
//! queued here and released a batch at a time on a fixed period.

use std::collections::{HashSet, VecDeque};

use crate::client::ChannelId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GovernorState {
    /// Nothing queued, no timer running
    Idle,
    /// At least one channel queued
    Armed,
}

#[derive(Debug)]
pub struct DisconnectGovernor {
    queue: VecDeque<ChannelId>,
    queued: HashSet<ChannelId>,
    batch: usize,
}

impl DisconnectGovernor {
    pub fn new(batch: usize) -> Self {
        DisconnectGovernor {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            batch: batch.max(1),
        }
    }

    pub fn state(&self) -> GovernorState {
        if self.queue.is_empty() {
            GovernorState::Idle
        } else {
            GovernorState::Armed
        }
    }

    /// Queue a channel. Returns true if this armed an idle governor.
    pub fn enqueue(&mut self, channel: ChannelId) -> bool {
        let was_idle = self.state() == GovernorState::Idle;
        if self.queued.insert(channel) {
            self.queue.push_back(channel);
        }
        was_idle && self.state() == GovernorState::Armed
    }

    /// Drop a channel that was closed while queued
    pub fn remove(&mut self, channel: ChannelId) {
        if self.queued.remove(&channel) {
            self.queue.retain(|c| *c != channel);
        }
    }

    /// Release up to one batch of channels, oldest first
    pub fn tick(&mut self) -> Vec<ChannelId> {
        let count = self.batch.min(self.queue.len());
        let released: Vec<_> = self.queue.drain(..count).collect();
        for channel in &released {
            self.queued.remove(channel);
        }
        released
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
