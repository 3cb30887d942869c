//! In-memory channels shared between application code and the server.
//!
//! [`IntercomProvider::add_pv`] creates a channel and returns an [`Intercom`],
//! a typed handle the application keeps. Storing through the handle updates
//! what clients read and publishes the change to subscribers.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    dbr::{DBR_CLASS_NAME, Dbr, DbrBasicType, DbrType, DbrValue, Status},
    messages::{Access, ErrorCondition},
    providers::{DeadbandFilter, EventFilter, EventPublisher, FieldLog, Provider, RateLimitFilter},
};

#[derive(Debug)]
struct PV {
    value: DbrValue,
    /// Minimum array length. If set, at least this many array items will
    /// be sent to clients, and if a longer value is assigned then this
    /// minimum length will be increased.
    minimum_length: Option<usize>,
    /// The last time this value was written
    timestamp: SystemTime,
    /// The EPICS record type, for CLASS_NAME requests
    record_type: Option<String>,
    deadband: Option<f64>,
    max_update_rate: Option<Duration>,
}

impl PV {
    fn new(value: DbrValue) -> Self {
        PV {
            value,
            minimum_length: None,
            timestamp: SystemTime::now(),
            record_type: None,
            deadband: None,
            max_update_rate: None,
        }
    }

    /// The value as sent to CA clients, padded out to any minimum length
    fn load_for_ca(&self, requested_type: Option<DbrType>) -> Dbr {
        if requested_type == Some(DBR_CLASS_NAME) {
            return Dbr::ClassName(
                self.record_type
                    .clone()
                    .unwrap_or_else(|| default_record_type(&self.value).to_string()),
            );
        }
        let mut value = self.value.clone();
        if let Some(size) = self.minimum_length
            && value.count() < size
        {
            value.resize(size);
        }
        Dbr::Time {
            status: Status::default(),
            timestamp: self.timestamp,
            value,
        }
    }

    /// Store a value, converting it to this channel's type.
    ///
    /// Strings from clients are parsed into numeric channels.
    fn store(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        self.value = value.convert_to(self.value.basic_type())?;
        if let Some(size) = self.minimum_length
            && self.value.count() > size
        {
            self.minimum_length = Some(self.value.count());
        }
        self.timestamp = SystemTime::now();
        Ok(())
    }

    fn filters(&self) -> Vec<Box<dyn EventFilter>> {
        let mut filters: Vec<Box<dyn EventFilter>> = Vec::new();
        if let Some(deadband) = self.deadband {
            filters.push(Box::new(DeadbandFilter::new(deadband)));
        }
        if let Some(period) = self.max_update_rate {
            filters.push(Box::new(RateLimitFilter::new(period)));
        }
        filters
    }
}

fn default_record_type(value: &DbrValue) -> &'static str {
    if value.count() > 1 {
        return "waveform";
    }
    match value.basic_type() {
        DbrBasicType::String => "stringin",
        DbrBasicType::Enum => "mbbi",
        DbrBasicType::Float | DbrBasicType::Double => "ai",
        DbrBasicType::Char | DbrBasicType::Int | DbrBasicType::Long => "longin",
    }
}

#[derive(Debug, Default)]
struct Naming {
    /// Inserted in front of every channel name
    prefix: String,
    /// Also serve every channel read-only with a "_RBV" suffix
    rbv: bool,
}

#[derive(Debug, Default)]
struct Shared {
    pvs: Mutex<HashMap<String, Arc<Mutex<PV>>>>,
    naming: Mutex<Naming>,
    publishers: Mutex<Vec<EventPublisher>>,
}

impl Shared {
    /// Announce a new value under every name the channel is served as
    fn publish(&self, name: &str, value: Dbr) {
        let names = {
            let naming = self.naming.lock();
            let mut names = vec![format!("{}{name}", naming.prefix)];
            if naming.rbv {
                names.push(format!("{}{name}_RBV", naming.prefix));
            }
            names
        };
        let publishers = {
            let mut publishers = self.publishers.lock();
            publishers.retain(EventPublisher::is_live);
            publishers.clone()
        };
        for publisher in &publishers {
            for name in &names {
                if publisher.has_subscribers(name) {
                    publisher.publish(name, FieldLog::value_change(value.clone()));
                }
            }
        }
    }
}

/// Typed interface to reading single values to/from a channel
#[derive(Clone, Debug)]
pub struct Intercom<T>
where
    T: TryFrom<DbrValue> + Default,
    DbrValue: From<T>,
{
    name: String,
    pv: Arc<Mutex<PV>>,
    shared: Arc<Shared>,
    _marker: PhantomData<T>,
}

impl<T> Intercom<T>
where
    T: TryFrom<DbrValue> + Default,
    DbrValue: From<T>,
{
    /// The current value. Falls back to the default if a client stored
    /// something that no longer reads back as `T`.
    pub fn load(&self) -> T {
        let value = self.pv.lock().value.clone();
        value.try_into().unwrap_or_default()
    }

    /// Set a new value and notify subscribers
    pub fn store(&self, value: T) {
        let published = {
            let mut pv = self.pv.lock();
            if let Err(e) = pv.store(&value.into()) {
                error!("Could not store value to {}: {e}", self.name);
                return;
            }
            pv.load_for_ca(None)
        };
        self.shared.publish(&self.name, published);
    }

    /// Suppress updates to subscribers smaller than `deadband`
    pub fn with_deadband(self, deadband: f64) -> Self {
        self.pv.lock().deadband = Some(deadband);
        self
    }

    /// Send subscribers at most one update per `period`
    pub fn with_max_update_rate(self, period: Duration) -> Self {
        self.pv.lock().max_update_rate = Some(period);
        self
    }

    /// Always send at least `length` elements, padding with zeros
    pub fn with_minimum_length(self, length: usize) -> Self {
        self.pv.lock().minimum_length = Some(length);
        self
    }

    /// The record type reported for DBR_CLASS_NAME
    pub fn with_record_type(self, record_type: &str) -> Self {
        self.pv.lock().record_type = Some(record_type.to_string());
        self
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("A channel named '{0}' already exists")]
pub struct PVAlreadyExists(pub String);

/// A [`Provider`] serving channels held in memory.
///
/// Clones share the same channels.
#[derive(Clone, Debug, Default)]
pub struct IntercomProvider {
    shared: Arc<Shared>,
}

impl IntercomProvider {
    pub fn new() -> IntercomProvider {
        IntercomProvider::default()
    }

    /// Serve every channel with `prefix` in front of its name
    pub fn with_prefix(self, prefix: &str) -> Self {
        self.shared.naming.lock().prefix = prefix.to_string();
        self
    }

    /// Also serve every channel read-only under its name with "_RBV" appended
    pub fn with_rbv(self, rbv: bool) -> Self {
        self.shared.naming.lock().rbv = rbv;
        self
    }

    pub fn add_pv<T>(&self, name: &str, initial_value: T) -> Result<Intercom<T>, PVAlreadyExists>
    where
        T: TryFrom<DbrValue> + Default,
        DbrValue: From<T>,
    {
        let mut pvs = self.shared.pvs.lock();
        if pvs.contains_key(name) {
            return Err(PVAlreadyExists(name.to_string()));
        }
        let pv = Arc::new(Mutex::new(PV::new(DbrValue::from(initial_value))));
        pvs.insert(name.to_string(), pv.clone());
        debug!("Added channel {name}");
        Ok(Intercom {
            name: name.to_string(),
            pv,
            shared: self.shared.clone(),
            _marker: PhantomData,
        })
    }

    /// Strip the prefix and any read-back suffix.
    ///
    /// Returns the stored name, and whether it was asked for as a read-back.
    fn normalize_pv_name<'a>(&self, pv_name: &'a str) -> Option<(&'a str, bool)> {
        let naming = self.shared.naming.lock();
        let name = pv_name.strip_prefix(naming.prefix.as_str())?;
        if naming.rbv
            && let Some(base) = name.strip_suffix("_RBV")
            && self.shared.pvs.lock().contains_key(base)
        {
            return Some((base, true));
        }
        Some((name, false))
    }

    fn pv(&self, pv_name: &str) -> Option<(String, bool, Arc<Mutex<PV>>)> {
        let (name, rbv) = self.normalize_pv_name(pv_name)?;
        let pv = self.shared.pvs.lock().get(name)?.clone();
        Some((name.to_string(), rbv, pv))
    }
}

impl Provider for IntercomProvider {
    fn provides(&self, pv_name: &str) -> bool {
        self.pv(pv_name).is_some()
    }

    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition> {
        let (_, _, pv) = self.pv(pv_name).ok_or(ErrorCondition::UnavailInServ)?;
        let value = pv.lock().load_for_ca(requested_type);
        Ok(value)
    }

    fn access_rights(
        &self,
        pv_name: &str,
        _client_user_name: Option<&str>,
        _client_host_name: Option<&str>,
    ) -> Access {
        match self.pv(pv_name) {
            Some((_, false, _)) => Access::ReadWrite,
            Some((_, true, _)) => Access::Read,
            None => Access::None,
        }
    }

    fn write_value(&self, pv_name: &str, value: Dbr) -> Result<(), ErrorCondition> {
        let (name, rbv, pv) = self.pv(pv_name).ok_or(ErrorCondition::UnavailInServ)?;
        // Don't allow writing of the implicit RBV
        if rbv {
            return Err(ErrorCondition::NoWtAccess);
        }
        debug!("Processing write to {name}: {value:?}");
        let published = {
            let mut pv = pv.lock();
            pv.store(&value.take_value()).inspect_err(|e| {
                error!("Write to {name} failed: {e}");
            })?;
            pv.load_for_ca(None)
        };
        self.shared.publish(&name, published);
        Ok(())
    }

    fn filters(&self, pv_name: &str) -> Vec<Box<dyn EventFilter>> {
        self.pv(pv_name)
            .map(|(_, _, pv)| pv.lock().filters())
            .unwrap_or_default()
    }

    fn attach(&self, publisher: EventPublisher) {
        self.shared.publishers.lock().push(publisher);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BackpressurePolicy,
        dbr::DbrCategory,
        messages::{Message, MonitorMask},
        server::{EventDispatcher, EventSink, SubscriptionRequest},
    };

    #[test]
    fn string_intercom() {
        let provider = IntercomProvider::new();
        let si = provider.add_pv("TEST", "Test String".to_string()).unwrap();
        assert_eq!(si.load(), "Test String");
        assert_eq!(
            provider.read_value("TEST", None).unwrap().data_type().basic_type,
            DbrBasicType::String
        );
        assert_eq!(
            provider.add_pv("TEST", 1i32).unwrap_err(),
            PVAlreadyExists("TEST".into())
        );
    }

    #[test]
    fn prefix_and_readback_names() {
        let provider = IntercomProvider::new().with_prefix("BL:").with_rbv(true);
        let pv = provider.add_pv("GAIN", 2.5f64).unwrap();
        assert!(provider.provides("BL:GAIN"));
        assert!(provider.provides("BL:GAIN_RBV"));
        assert!(!provider.provides("GAIN"));
        assert_eq!(provider.access_rights("BL:GAIN_RBV", None, None), Access::Read);
        assert_eq!(provider.access_rights("BL:GAIN", None, None), Access::ReadWrite);
        assert_eq!(
            provider.write_value("BL:GAIN_RBV", Dbr::Basic(DbrValue::Double(vec![1.0]))),
            Err(ErrorCondition::NoWtAccess)
        );
        provider
            .write_value("BL:GAIN", Dbr::Basic(DbrValue::from("7.25")))
            .unwrap();
        assert_eq!(pv.load(), 7.25);
    }

    #[test]
    fn class_names_and_minimum_lengths() {
        let provider = IntercomProvider::new();
        provider
            .add_pv("WAVE", vec![1i32, 2])
            .unwrap()
            .with_minimum_length(4)
            .with_record_type("compress");
        assert_eq!(
            provider.read_value("WAVE", Some(DBR_CLASS_NAME)).unwrap(),
            Dbr::ClassName("compress".into())
        );
        let value = provider
            .read_value("WAVE", Some(DbrType::new(DbrBasicType::Long, DbrCategory::Time)))
            .unwrap();
        assert_eq!(value.take_value(), DbrValue::Long(vec![1, 2, 0, 0]));
    }

    #[test]
    fn stores_reach_subscribers_under_every_name() {
        let provider = IntercomProvider::new().with_rbv(true);
        let pv = provider.add_pv("COUNT", 0i32).unwrap();
        let dispatcher = EventDispatcher::new(BackpressurePolicy::LatestValueOnly);
        provider.attach(dispatcher.publisher());
        let sink = Arc::new(EventSink::new(16));
        for (subscription_id, name) in [(1, "COUNT"), (2, "COUNT_RBV")] {
            dispatcher.register_subscription(
                name,
                SubscriptionRequest {
                    subscription_id,
                    data_type: DbrType::new(DbrBasicType::Long, DbrCategory::Basic),
                    data_count: 1,
                    mask: MonitorMask::VALUE,
                },
                provider.filters(name),
                sink.clone(),
                provider.read_value(name, None).unwrap(),
            );
        }
        assert_eq!(sink.queue().drain().len(), 2);
        pv.store(5);
        let updates: Vec<u32> = sink
            .queue()
            .drain()
            .into_iter()
            .map(|m| match m {
                Message::EventAddResponse(update) => update.subscription_id,
                other => panic!("Unexpected {other:?}"),
            })
            .collect();
        assert_eq!(updates, vec![1, 2]);
    }

    #[test]
    fn deadband_applies_to_subscribers() {
        let provider = IntercomProvider::new();
        let pv = provider.add_pv("TEMP", 20.0f64).unwrap().with_deadband(0.5);
        let dispatcher = EventDispatcher::new(BackpressurePolicy::LatestValueOnly);
        provider.attach(dispatcher.publisher());
        let sink = Arc::new(EventSink::new(16));
        dispatcher.register_subscription(
            "TEMP",
            SubscriptionRequest {
                subscription_id: 1,
                data_type: DbrType::new(DbrBasicType::Double, DbrCategory::Basic),
                data_count: 1,
                mask: MonitorMask::VALUE,
            },
            provider.filters("TEMP"),
            sink.clone(),
            provider.read_value("TEMP", None).unwrap(),
        );
        pv.store(20.2);
        pv.store(21.0);
        assert_eq!(sink.queue().drain().len(), 2);
    }
}
