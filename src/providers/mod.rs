//! Interface between the CA server and rust code
//!
//! A [`Provider`] answers for a set of channel names. The server asks it for
//! values and hands it writes; the provider pushes changes back through the
//! [`EventPublisher`] it is given when the server starts.

pub mod intercom;
pub use intercom::IntercomProvider;

use std::time::{Duration, Instant};

pub use crate::server::EventPublisher;
use crate::{
    dbr::{Dbr, DbrType},
    messages::{Access, ErrorCondition, MonitorMask},
};

/// One change to a channel, as offered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLog {
    pub value: Dbr,
    /// What kind of change this is; subscriptions only see events their mask selects
    pub mask: MonitorMask,
}

impl FieldLog {
    pub fn new(value: Dbr, mask: MonitorMask) -> Self {
        FieldLog { value, mask }
    }

    /// A value change, reported to both value and archive subscribers
    pub fn value_change(value: Dbr) -> Self {
        FieldLog::new(value, MonitorMask::VALUE | MonitorMask::LOG)
    }
}

/// Provides channel values for a server
pub trait Provider: Send + Sync + 'static {
    /// Does this provider control the given channel name?
    fn provides(&self, pv_name: &str) -> bool;

    /// Fetch a single channel value.
    ///
    /// The type requested by the caller is provided, but this is only
    /// a request - you can return any type you wish from this function,
    /// and it will be automatically converted to the target type (if
    /// such a safe conversion exists).
    ///
    /// The value returned with no requested_type is used for the native
    /// type and element count reported to clients creating the channel.
    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition>;

    #[allow(unused_variables)]
    fn access_rights(
        &self,
        pv_name: &str,
        client_user_name: Option<&str>,
        client_host_name: Option<&str>,
    ) -> Access {
        Access::Read
    }

    /// Write a value sent by a client.
    ///
    /// The value arrives in whatever type the client chose to send; `caput`
    /// usually sends strings.
    #[allow(unused_variables)]
    fn write_value(&self, pv_name: &str, value: Dbr) -> Result<(), ErrorCondition> {
        Err(ErrorCondition::NoWtAccess)
    }

    /// Filters to run on every event for a new subscription to `pv_name`.
    ///
    /// Called once per subscription, so filters may keep state.
    #[allow(unused_variables)]
    fn filters(&self, pv_name: &str) -> Vec<Box<dyn EventFilter>> {
        Vec::new()
    }

    /// Called once when a server starts serving this provider
    #[allow(unused_variables)]
    fn attach(&self, publisher: EventPublisher) {}
}

/// Pre-event filter, run in order before an update is queued for a client.
///
/// Returning `None` drops the event for this subscription only.
pub trait EventFilter: Send {
    fn filter(&mut self, log: FieldLog) -> Option<FieldLog>;
}

/// Drop value changes smaller than a deadband around the last value passed on
#[derive(Debug, Clone)]
pub struct DeadbandFilter {
    deadband: f64,
    last: Option<f64>,
}

impl DeadbandFilter {
    pub fn new(deadband: f64) -> Self {
        DeadbandFilter {
            deadband: deadband.abs(),
            last: None,
        }
    }
}

impl EventFilter for DeadbandFilter {
    fn filter(&mut self, log: FieldLog) -> Option<FieldLog> {
        // Alarm and property events are never suppressed
        if !log.mask.intersects(MonitorMask::VALUE | MonitorMask::LOG) {
            return Some(log);
        }
        let Some(current) = log.value.value().first_as_f64() else {
            return Some(log);
        };
        if let Some(last) = self.last
            && !(current - last).is_nan()
            && (current - last).abs() <= self.deadband
        {
            return None;
        }
        self.last = Some(current);
        Some(log)
    }
}

/// Pass at most one event per period
#[derive(Debug, Clone)]
pub struct RateLimitFilter {
    period: Duration,
    last_passed: Option<Instant>,
}

impl RateLimitFilter {
    pub fn new(period: Duration) -> Self {
        RateLimitFilter {
            period,
            last_passed: None,
        }
    }

    fn filter_at(&mut self, log: FieldLog, now: Instant) -> Option<FieldLog> {
        if self
            .last_passed
            .is_some_and(|last| now.saturating_duration_since(last) < self.period)
        {
            return None;
        }
        self.last_passed = Some(now);
        Some(log)
    }
}

impl EventFilter for RateLimitFilter {
    fn filter(&mut self, log: FieldLog) -> Option<FieldLog> {
        self.filter_at(log, Instant::now())
    }
}

/// Run a log through a filter chain, stopping at the first filter that drops it
pub(crate) fn apply_filters(filters: &mut [Box<dyn EventFilter>], log: FieldLog) -> Option<FieldLog> {
    filters.iter_mut().try_fold(log, |log, filter| filter.filter(log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::DbrValue;

    fn double(value: f64) -> FieldLog {
        FieldLog::value_change(Dbr::Basic(DbrValue::Double(vec![value])))
    }

    #[test]
    fn deadband_suppresses_small_changes() {
        let mut filter = DeadbandFilter::new(0.5);
        assert!(filter.filter(double(1.0)).is_some());
        assert!(filter.filter(double(1.3)).is_none());
        assert!(filter.filter(double(1.5)).is_none());
        // Measured from the last value passed, not the last value seen
        assert!(filter.filter(double(1.6)).is_some());
        let alarm = FieldLog::new(double(1.6).value, MonitorMask::ALARM);
        assert!(filter.filter(alarm).is_some());
    }

    #[test]
    fn rate_limit_passes_one_per_period() {
        let mut filter = RateLimitFilter::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(filter.filter_at(double(1.0), start).is_some());
        assert!(filter.filter_at(double(2.0), start + Duration::from_millis(50)).is_none());
        assert!(filter.filter_at(double(3.0), start + Duration::from_millis(100)).is_some());
    }

    #[test]
    fn chain_stops_at_first_drop() {
        let mut filters: Vec<Box<dyn EventFilter>> = vec![
            Box::new(DeadbandFilter::new(1.0)),
            Box::new(RateLimitFilter::new(Duration::from_secs(60))),
        ];
        assert!(apply_filters(&mut filters, double(0.0)).is_some());
        // Dropped by the deadband, so the rate limiter never sees it
        assert!(apply_filters(&mut filters, double(0.5)).is_none());
        assert!(apply_filters(&mut filters, double(5.0)).is_none());
    }
}
