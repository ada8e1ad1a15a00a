//! Per-rule fact memory with temporal validity.
//!
//! Every trigger records a fact together with its origin node and a validity
//! window. A fact only becomes visible to conditions once it has settled
//! (`settle`), and disappears once its `lifetime` has elapsed.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use twin_core::NodeRef;

use crate::fact::Fact;

/// Validity window of a recorded fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Minimum age before the fact is trusted.
    pub settle: Duration,
    /// Age at which the fact expires; `None` never expires.
    pub lifetime: Option<Duration>,
}

impl Validity {
    pub const ALWAYS: Validity = Validity {
        settle: Duration::ZERO,
        lifetime: None,
    };

    /// Build from millisecond settings where a negative `valid_until_ms`
    /// means "never expires" and a non-positive delay means "no settle time".
    pub fn from_millis(valid_delay_ms: i64, valid_until_ms: i64) -> Self {
        Self {
            settle: Duration::from_millis(valid_delay_ms.max(0) as u64),
            lifetime: (valid_until_ms >= 0).then(|| Duration::from_millis(valid_until_ms as u64)),
        }
    }
}

impl Default for Validity {
    fn default() -> Self {
        Self::ALWAYS
    }
}

/// A fact plus provenance and validity bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedRuleRecord {
    fact: Fact,
    source: NodeRef,
    created: Instant,
    validity: Validity,
}

impl CachedRuleRecord {
    pub fn new(source: NodeRef, fact: Fact, validity: Validity) -> Self {
        Self {
            fact,
            source,
            created: Instant::now(),
            validity,
        }
    }

    pub fn fact(&self) -> &Fact {
        &self.fact
    }

    pub fn source(&self) -> &NodeRef {
        &self.source
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.validity.lifetime {
            Some(lifetime) => now.saturating_duration_since(self.created) >= lifetime,
            None => false,
        }
    }

    pub fn is_valid_now(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        !self.is_expired_at(now)
            && (self.validity.settle.is_zero()
                || now.saturating_duration_since(self.created) >= self.validity.settle)
    }
}

/// Fact memory of one rule, keyed by fact name (last write wins).
#[derive(Debug, Default)]
pub struct FactMemory {
    records: Mutex<HashMap<String, CachedRuleRecord>>,
}

impl FactMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new entry, replacing any fact with the same name.
    pub fn record(&self, source: NodeRef, fact: Fact, validity: Validity) {
        let record = CachedRuleRecord::new(source, fact, validity);
        self.records
            .lock()
            .insert(record.fact().name().to_string(), record);
    }

    /// Facts valid right now.
    pub fn valid_facts(&self) -> Vec<Fact> {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| r.is_valid_at(now))
            .map(|r| r.fact().clone())
            .collect()
    }

    /// Value of a currently valid fact.
    pub fn valid_value(&self, name: &str) -> Option<Value> {
        self.records
            .lock()
            .get(name)
            .filter(|r| r.is_valid_now())
            .map(|r| r.fact().value().clone())
    }

    /// Drop expired entries, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired_at(now));
        before - records.len()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Snapshot of all stored entries, valid or not.
    pub fn records(&self) -> Vec<CachedRuleRecord> {
        self.records.lock().values().cloned().collect()
    }
}
