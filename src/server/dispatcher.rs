//! Fan-out of channel changes to subscribed clients.
//!
//! Every subscription on every circuit of a server is held here, indexed by
//! channel name. [`EventDispatcher::publish`] picks the subscriptions whose
//! mask selects the event, runs their filters, renders an EVENT_ADD update in
//! the requested type and queues it on the owning circuit's [`EventSink`].
//!
//! Rendering happens under the dispatcher lock; queueing does not. Publishes
//! to one channel are serialised end to end, so every subscriber's queue ends
//! on the update rendered last.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    config::BackpressurePolicy,
    dbr::{Dbr, DbrType},
    messages::{ErrorCondition, EventAddResponse, Message, MonitorMask},
    providers::{EventFilter, FieldLog, apply_filters},
    queue::SendQueue,
};

/// Identifies a subscription across every circuit of one server
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a client asked for in EVENT_ADD
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SubscriptionRequest {
    /// The client's id for the subscription, echoed in every update
    pub subscription_id: u32,
    pub data_type: DbrType,
    /// Zero sends however many elements the value currently has
    pub data_count: u32,
    pub mask: MonitorMask,
}

#[derive(Debug, Default)]
struct FlowControl {
    paused: bool,
    /// Latest update per subscription held back while paused
    parked: BTreeMap<SubscriptionId, Message>,
}

/// The outbound side of one server circuit
#[derive(Debug)]
pub(crate) struct EventSink {
    queue: SendQueue,
    flow: Mutex<FlowControl>,
}

impl EventSink {
    pub fn new(high_water: usize) -> Self {
        EventSink {
            queue: SendQueue::new(high_water),
            flow: Mutex::new(FlowControl::default()),
        }
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    /// EVENTS_OFF: hold updates back until [`EventSink::events_on`]
    pub fn events_off(&self) {
        self.flow.lock().paused = true;
    }

    /// EVENTS_ON: resume, sending the newest held update for each subscription
    pub fn events_on(&self) {
        let mut flow = self.flow.lock();
        flow.paused = false;
        for (id, message) in std::mem::take(&mut flow.parked) {
            self.queue.push_replacing(id.0, message);
        }
    }

    fn deliver(&self, id: SubscriptionId, message: Message, policy: BackpressurePolicy) {
        if let BackpressurePolicy::BlockWithTimeout(timeout) = policy
            && self.queue.is_above_high_water()
            && !self.queue.wait_below_high_water(timeout)
        {
            debug!("Client queue still backed up after {timeout:?}, coalescing updates");
        }
        let mut flow = self.flow.lock();
        if flow.paused {
            flow.parked.insert(id, message);
            return;
        }
        // Holding the flow lock keeps this behind any flush from events_on
        if !self.queue.push_replacing(id.0, message) {
            trace!("Dropping update for subscription {id} on closed circuit");
        }
    }

    fn forget(&self, id: SubscriptionId) {
        self.flow.lock().parked.remove(&id);
    }
}

struct Subscription {
    channel: String,
    request: SubscriptionRequest,
    filters: Vec<Box<dyn EventFilter>>,
    sink: Arc<EventSink>,
}

#[derive(Default)]
struct Subscriptions {
    by_id: HashMap<SubscriptionId, Subscription>,
    by_channel: HashMap<String, BTreeSet<SubscriptionId>>,
    /// Held by a publish from rendering until its updates are queued
    publishing: HashMap<String, Arc<Mutex<()>>>,
    next_id: u64,
}

struct DispatcherInner {
    subscriptions: Mutex<Subscriptions>,
    policy: BackpressurePolicy,
}

/// Server-wide registry of subscriptions
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

/// Handle given to providers for announcing changes.
///
/// Holds no strong reference, so a provider outliving its server simply
/// publishes into nothing.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    inner: Weak<DispatcherInner>,
}

impl EventPublisher {
    /// Offer a change on `channel` to every subscriber of it.
    ///
    /// Under [`BackpressurePolicy::BlockWithTimeout`] this may block the
    /// calling thread while a client's queue drains.
    pub fn publish(&self, channel: &str, log: FieldLog) {
        if let Some(inner) = self.inner.upgrade() {
            EventDispatcher { inner }.publish(channel, log);
        }
    }

    /// Is anyone subscribed to `channel`? Lets providers skip building values.
    pub fn has_subscribers(&self, channel: &str) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.subscriptions.lock().by_channel.contains_key(channel))
    }

    /// False once the server this came from has gone
    pub fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl EventDispatcher {
    pub fn new(policy: BackpressurePolicy) -> Self {
        EventDispatcher {
            inner: Arc::new(DispatcherInner {
                subscriptions: Mutex::new(Subscriptions::default()),
                policy,
            }),
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Add a subscription and queue its first update from `initial`.
    ///
    /// The first update always goes out, whatever the mask or filters say,
    /// though the filters still see it.
    pub(crate) fn register_subscription(
        &self,
        channel: &str,
        request: SubscriptionRequest,
        mut filters: Vec<Box<dyn EventFilter>>,
        sink: Arc<EventSink>,
        initial: Dbr,
    ) -> SubscriptionId {
        let initial = FieldLog::new(initial, request.mask);
        let value = apply_filters(&mut filters, initial.clone()).unwrap_or(initial).value;
        let message = render(&request, &value);

        let mut subscriptions = self.inner.subscriptions.lock();
        let id = SubscriptionId(subscriptions.next_id);
        subscriptions.next_id += 1;
        subscriptions
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(id);
        subscriptions
            .publishing
            .entry(channel.to_string())
            .or_default();
        subscriptions.by_id.insert(
            id,
            Subscription {
                channel: channel.to_string(),
                request,
                filters,
                sink: sink.clone(),
            },
        );
        debug!("Registered subscription {id} to {channel}");
        // Queued before the lock is released so no published update can overtake it
        sink.deliver(id, message, BackpressurePolicy::LatestValueOnly);
        id
    }

    /// Remove a subscription. Updates already queued still go out.
    pub fn cancel_subscription(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let Some(subscription) = subscriptions.by_id.remove(&id) else {
                return false;
            };
            if let Some(ids) = subscriptions.by_channel.get_mut(&subscription.channel) {
                ids.remove(&id);
                if ids.is_empty() {
                    subscriptions.by_channel.remove(&subscription.channel);
                    subscriptions.publishing.remove(&subscription.channel);
                }
            }
            subscription
        };
        removed.sink.forget(id);
        debug!("Cancelled subscription {id} to {}", removed.channel);
        true
    }

    /// Offer a change on `channel` to its subscribers
    pub fn publish(&self, channel: &str, log: FieldLog) {
        let publishing = self.inner.subscriptions.lock().publishing.get(channel).cloned();
        let Some(publishing) = publishing else {
            return;
        };
        let _in_order = publishing.lock();
        let deliveries: Vec<_> = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let Subscriptions {
                by_id, by_channel, ..
            } = &mut *subscriptions;
            let Some(ids) = by_channel.get(channel) else {
                return;
            };
            ids.iter()
                .filter_map(|id| {
                    let subscription = by_id.get_mut(id)?;
                    if !subscription.request.mask.intersects(log.mask) {
                        return None;
                    }
                    let log = apply_filters(&mut subscription.filters, log.clone())?;
                    Some((
                        *id,
                        subscription.sink.clone(),
                        render(&subscription.request, &log.value),
                    ))
                })
                .collect()
        };
        trace!("Publishing {channel} to {} subscribers", deliveries.len());
        for (id, sink, message) in deliveries {
            sink.deliver(id, message, self.inner.policy);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().by_id.len()
    }
}

/// Build the EVENT_ADD update a subscription should receive for `value`
fn render(request: &SubscriptionRequest, value: &Dbr) -> Message {
    let count = (request.data_count > 0).then_some(request.data_count as usize);
    let (status, elements, mut data) = match value.convert_to(request.data_type) {
        Ok(converted) => {
            let (elements, data) = converted.to_bytes(count);
            (ErrorCondition::Normal, elements, data)
        }
        Err(condition) => {
            let elements = count.unwrap_or(1);
            (
                condition,
                elements,
                vec![0; request.data_type.payload_size(elements)],
            )
        }
    };
    let mut elements = elements;
    // An empty update reads as a cancellation confirmation
    if data.is_empty() {
        elements = 1;
        data = vec![0; request.data_type.payload_size(1)];
    }
    EventAddResponse {
        data_type: request.data_type,
        data_count: elements as u32,
        status,
        subscription_id: request.subscription_id,
        data,
    }
    .into()
}
