//! Dismissed merge pairs.

use crate::engine::Engine;
use crate::error::PeopleError;

/// An unordered pair of distinct persons, stored as `(low, high)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersonPair {
    low: String,
    high: String,
}

impl PersonPair {
    /// Normalize `{a, b}`. Returns `None` for a self-pair.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        match a.cmp(b) {
            std::cmp::Ordering::Less => Some(Self {
                low: a.to_string(),
                high: b.to_string(),
            }),
            std::cmp::Ordering::Greater => Some(Self {
                low: b.to_string(),
                high: a.to_string(),
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn low(&self) -> &str {
        &self.low
    }

    pub fn high(&self) -> &str {
        &self.high
    }
}

impl Engine {
    /// Record that `a` and `b` are different people so they are never
    /// suggested or auto-merged again.
    pub fn dismiss_suggestion(&self, a: &str, b: &str) -> Result<(), PeopleError> {
        let pair = PersonPair::new(a, b)
            .ok_or_else(|| PeopleError::InvalidArgument(format!("cannot dismiss {a} with itself")))?;
        self.transact("dismiss suggestion", |txn| {
            let low = self.require_person(pair.low())?;
            let high = self.require_person(pair.high())?;
            txn.touch(&low);
            txn.touch(&high);
            txn.add_edge(pair.low(), pair.high());
            Ok(())
        })?;
        tracing::info!(a = pair.low(), b = pair.high(), "people: merge suggestion dismissed");
        Ok(())
    }

    /// Remove a dismissal. Missing persons or edges are not an error.
    pub fn undismiss(&self, a: &str, b: &str) -> Result<(), PeopleError> {
        let Some(pair) = PersonPair::new(a, b) else {
            return Ok(());
        };
        self.transact("undismiss", |txn| {
            for id in [pair.low(), pair.high()] {
                if let Some(p) = self.store.person(id)? {
                    txn.touch(&p);
                }
            }
            txn.remove_edge(pair.low(), pair.high());
            Ok(())
        })
    }

    /// Persons `id` must not be merged with, in id order.
    pub fn ignored_merges(&self, id: &str) -> Result<Vec<String>, PeopleError> {
        self.require_person(id)?;
        self.store.ignored(id)
    }
}
