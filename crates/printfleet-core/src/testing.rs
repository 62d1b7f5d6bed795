// In-process fakes shared by unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::events::{EventKind, EventSink};
use crate::model::{DeviceAttributes, LearnedOids, LockField, MetricsReading};
use crate::query::{DeviceQuery, Identification, QueryMode};

#[derive(Debug, Default)]
pub(crate) struct FakeQuery {
    full: Mutex<HashMap<IpAddr, Identification>>,
    deep: Mutex<HashMap<IpAddr, Identification>>,
    metrics: Mutex<HashMap<IpAddr, MetricsReading>>,
    failing: Mutex<HashSet<IpAddr>>,
    search_oid: Mutex<Option<String>>,
    search_error: Mutex<Option<String>>,
    calls: Mutex<Vec<(IpAddr, QueryMode)>>,
    learned_seen: Mutex<Vec<LearnedOids>>,
}

impl FakeQuery {
    pub fn answer(&self, ip: &str, serial: &str, model: &str) {
        let id = Identification {
            serial: Some(serial.into()),
            attributes: DeviceAttributes {
                manufacturer: Some("HP".into()),
                model: Some(model.into()),
                ..DeviceAttributes::default()
            },
            ..Identification::default()
        };
        self.full.lock().unwrap().insert(ip.parse().unwrap(), id);
    }

    pub fn answer_deep_only(&self, ip: &str, serial: &str) {
        let addr: IpAddr = ip.parse().unwrap();
        self.full
            .lock()
            .unwrap()
            .insert(addr, Identification::default());
        self.deep.lock().unwrap().insert(
            addr,
            Identification {
                serial: Some(serial.into()),
                ..Identification::default()
            },
        );
    }

    pub fn metrics(&self, ip: &str, reading: MetricsReading) {
        self.metrics.lock().unwrap().insert(ip.parse().unwrap(), reading);
    }

    pub fn fail(&self, ip: &str) {
        self.failing.lock().unwrap().insert(ip.parse().unwrap());
    }

    pub fn recover(&self, ip: &str) {
        self.failing.lock().unwrap().remove(&ip.parse().unwrap());
    }

    pub fn search_finds(&self, oid: &str) {
        *self.search_oid.lock().unwrap() = Some(oid.into());
    }

    pub fn search_fails(&self, reason: &str) {
        *self.search_error.lock().unwrap() = Some(reason.into());
    }

    pub fn calls(&self) -> Vec<(IpAddr, QueryMode)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn learned_seen(&self) -> Vec<LearnedOids> {
        self.learned_seen.lock().unwrap().clone()
    }

    fn check(&self, addr: IpAddr) -> Result<(), CoreError> {
        if self.failing.lock().unwrap().contains(&addr) {
            return Err(CoreError::Timeout {
                address: addr.to_string(),
                timeout_secs: 5,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceQuery for FakeQuery {
    async fn query(
        &self,
        addr: IpAddr,
        mode: QueryMode,
        _vendor_hint: Option<&str>,
        _timeout: Duration,
    ) -> Result<Identification, CoreError> {
        self.calls.lock().unwrap().push((addr, mode));
        self.check(addr)?;
        let table = match mode {
            QueryMode::Deep => &self.deep,
            QueryMode::Liveness | QueryMode::Full => &self.full,
        };
        table
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or_else(|| CoreError::QueryFailed {
                address: addr.to_string(),
                reason: "no response".into(),
            })
    }

    async fn collect_metrics(
        &self,
        addr: IpAddr,
        _vendor_hint: Option<&str>,
        learned: &LearnedOids,
        _timeout: Duration,
    ) -> Result<MetricsReading, CoreError> {
        self.check(addr)?;
        self.learned_seen.lock().unwrap().push(learned.clone());
        Ok(self
            .metrics
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_value(
        &self,
        addr: IpAddr,
        _vendor_hint: Option<&str>,
        _field: LockField,
        _value: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, CoreError> {
        if let Some(reason) = self.search_error.lock().unwrap().clone() {
            return Err(CoreError::QueryFailed {
                address: addr.to_string(),
                reason,
            });
        }
        Ok(self.search_oid.lock().unwrap().clone())
    }
}

/// Remembers every published event.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(EventKind, Value)>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    pub fn last(&self, kind: EventKind) -> Option<Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.clone())
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, kind: EventKind, payload: Value) {
        self.events.lock().unwrap().push((kind, payload));
    }
}
