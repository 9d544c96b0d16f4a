//! Per-run context handed to every function call.
//!
//! A `RunContext` lives for exactly one agent run. It carries the injected
//! clock and any state a function keeps between calls (for example a persona's
//! conversation history). Two samples never share a context.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

/// Source of "now" for time-relative functions.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant, used to replay a sample's reference date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(DateTime<Utc>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    /// Midnight UTC on `date`.
    pub fn at_date(date: NaiveDate) -> Self {
        Self(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Owned, mutable state scoped to one agent run.
pub struct RunContext {
    clock: Arc<dyn Clock>,
    state: HashMap<String, Box<dyn Any + Send>>,
}

impl RunContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: HashMap::new(),
        }
    }

    /// Context whose clock is frozen at `date`, or the system clock when absent.
    pub fn for_date(date: Option<NaiveDate>) -> Self {
        match date {
            Some(d) => Self::new(Arc::new(FixedClock::at_date(d))),
            None => Self::new(Arc::new(SystemClock)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// State slot for `key`, created with `T::default()` on first access.
    ///
    /// A slot holding a different type is replaced.
    pub fn state_mut<T: Default + Send + 'static>(&mut self, key: &str) -> &mut T {
        let slot = self
            .state
            .entry(key.to_string())
            .or_insert_with(|| Box::new(T::default()));
        if !slot.is::<T>() {
            *slot = Box::new(T::default());
        }
        slot.downcast_mut::<T>().expect("slot holds T")
    }

    pub fn state<T: 'static>(&self, key: &str) -> Option<&T> {
        self.state.get(key).and_then(|s| s.downcast_ref::<T>())
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("clock", &self.clock)
            .field("state_keys", &self.state.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixed_clock_reports_reference_date() {
        let date = NaiveDate::from_ymd_opt(2023, 11, 26).unwrap();
        let cx = RunContext::for_date(Some(date));
        assert_eq!(cx.today(), date);
        assert_eq!(cx.now().to_rfc3339(), "2023-11-26T00:00:00+00:00");
    }

    #[test]
    fn state_slots_are_keyed_and_persist() {
        let mut cx = RunContext::default();
        cx.state_mut::<Vec<String>>("send_message").push("hi".into());
        cx.state_mut::<Vec<String>>("send_message").push("there".into());
        cx.state_mut::<Vec<String>>("other").push("x".into());

        assert_eq!(
            cx.state::<Vec<String>>("send_message").unwrap(),
            &vec!["hi".to_string(), "there".to_string()]
        );
        assert_eq!(cx.state::<Vec<String>>("other").unwrap().len(), 1);
        assert!(cx.state::<Vec<String>>("missing").is_none());
    }

    #[test]
    fn separate_contexts_do_not_share_state() {
        let mut a = RunContext::default();
        let b = RunContext::default();
        *a.state_mut::<u32>("counter") += 1;
        assert_eq!(a.state::<u32>("counter"), Some(&1));
        assert!(b.state::<u32>("counter").is_none());
    }
}
