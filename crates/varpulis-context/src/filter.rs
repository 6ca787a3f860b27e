//! Filter specifications and per-partition filter addenda.
//!
//! A statement consumes events through one or more [`FilterSpec`]s. Each
//! context level narrows those filters for a given partition by contributing
//! [`FilterConstraint`]s; the orchestrator merges the contributions of every
//! level into one [`FilterAddendum`].
//!
//! The addendum is keyed by filter *identity* (`Arc` pointer), not by value:
//! two statements may compile structurally identical filters, and the same
//! filter object may be shared, but the constraints always belong to the
//! exact filter instance the statement holds.

use crate::event::Event;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use varpulis_core::Value;

/// Comparison applied to one event property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// `property = value`
    Equal(Value),
    /// `property in (v1, v2, ...)`
    In(Vec<Value>),
    /// `low <= property < high` (numeric comparison when both sides are numbers)
    Range { low: Value, high: Value },
    /// `hash(property) % granularity = bucket`
    HashBucket { granularity: i64, bucket: i64 },
}

/// A single narrowing constraint on an event property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConstraint {
    pub property: String,
    pub op: FilterOp,
}

impl FilterConstraint {
    pub fn equal(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::Equal(value.into()),
        }
    }

    pub fn in_list(property: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::In(values),
        }
    }

    pub fn range(property: impl Into<String>, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::Range {
                low: low.into(),
                high: high.into(),
            },
        }
    }

    pub fn hash_bucket(property: impl Into<String>, granularity: i64, bucket: i64) -> Self {
        Self {
            property: property.into(),
            op: FilterOp::HashBucket {
                granularity,
                bucket,
            },
        }
    }

    /// Evaluate against an event. A missing property compares as `Null`.
    pub fn matches(&self, event: &Event) -> bool {
        let value = event.get(&self.property).unwrap_or(&Value::Null);
        match &self.op {
            FilterOp::Equal(expected) => value.numeric_cmp(expected) == Ordering::Equal,
            FilterOp::In(values) => values
                .iter()
                .any(|v| value.numeric_cmp(v) == Ordering::Equal),
            FilterOp::Range { low, high } => {
                !value.is_null()
                    && value.numeric_cmp(low) != Ordering::Less
                    && value.numeric_cmp(high) == Ordering::Less
            }
            FilterOp::HashBucket {
                granularity,
                bucket,
            } => hash_bucket(value, *granularity) == *bucket,
        }
    }
}

impl fmt::Display for FilterConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            FilterOp::Equal(v) => write!(f, "{} = {}", self.property, v),
            FilterOp::In(values) => {
                write!(f, "{} in (", self.property)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            FilterOp::Range { low, high } => {
                write!(f, "{} in [{}:{})", self.property, low, high)
            }
            FilterOp::HashBucket {
                granularity,
                bucket,
            } => write!(
                f,
                "hash({}) % {} = {}",
                self.property, granularity, bucket
            ),
        }
    }
}

/// Bucket a value into `0..granularity` using the Fx hash of the value.
///
/// Deterministic across runs and processes, which hash-coalesced contexts
/// rely on when partitions are recovered. A non-positive granularity puts
/// everything in bucket 0.
pub fn hash_bucket(value: &Value, granularity: i64) -> i64 {
    if granularity <= 0 {
        return 0;
    }
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    (hasher.finish() % granularity as u64) as i64
}

/// A compiled event filter: an event type plus the statement's own
/// constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub event_type: String,
    #[serde(default)]
    pub constraints: Vec<FilterConstraint>,
}

impl FilterSpec {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: FilterConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn shared(self) -> Arc<FilterSpec> {
        Arc::new(self)
    }

    /// Whether the event has this filter's type and passes its own constraints.
    pub fn matches(&self, event: &Event) -> bool {
        *event.event_type == *self.event_type && self.constraints.iter().all(|c| c.matches(event))
    }
}

/// Identity key for a shared filter specification.
#[derive(Debug, Clone)]
struct FilterKey(Arc<FilterSpec>);

impl PartialEq for FilterKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for FilterKey {}

impl Hash for FilterKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// Additional per-partition constraints, keyed by filter identity.
///
/// Merging is additive: contributing constraints for a filter that already
/// has some appends to its list, never replaces it.
#[derive(Debug, Clone, Default)]
pub struct FilterAddendum {
    entries: IndexMap<FilterKey, Vec<FilterConstraint>>,
}

impl FilterAddendum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append constraints for a filter.
    pub fn add<I>(&mut self, filter: &Arc<FilterSpec>, constraints: I)
    where
        I: IntoIterator<Item = FilterConstraint>,
    {
        self.entries
            .entry(FilterKey(Arc::clone(filter)))
            .or_default()
            .extend(constraints);
    }

    /// Merge another addendum into this one.
    pub fn merge(&mut self, other: FilterAddendum) {
        for (key, constraints) in other.entries {
            self.entries.entry(key).or_default().extend(constraints);
        }
    }

    /// Constraints contributed for a filter, empty if none.
    pub fn constraints_for(&self, filter: &Arc<FilterSpec>) -> &[FilterConstraint] {
        self.entries
            .get(&FilterKey(Arc::clone(filter)))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct filters that received constraints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether an event passes `filter` narrowed by this addendum.
    pub fn matches(&self, filter: &Arc<FilterSpec>, event: &Event) -> bool {
        filter.matches(event) && self.constraints_for(filter).iter().all(|c| c.matches(event))
    }
}

impl fmt::Display for FilterAddendum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, constraints)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}(", key.0.event_type)?;
            for (j, c) in constraints.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", c)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
