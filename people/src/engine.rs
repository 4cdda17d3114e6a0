use std::sync::Arc;

use photoid_kv::KVStore;

use crate::config::EngineConfig;
use crate::error::PeopleError;
use crate::store::{Store, Txn, Versioned};
use crate::types::Person;

/// The identity-resolution engine.
///
/// Holds no state besides the store handle and configuration, so one engine
/// can be shared across threads and several engines may work on one store.
/// Operations are grouped by concern in the sibling modules.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) cfg: EngineConfig,
}

impl Engine {
    /// Create an engine over `kv`. The configuration is validated first.
    pub fn new(kv: Arc<dyn KVStore>, cfg: EngineConfig) -> Result<Self, PeopleError> {
        cfg.validate()?;
        Ok(Self {
            store: Store::new(kv),
            cfg,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Read current state, build one transaction and commit it.
    ///
    /// `build` runs again from scratch after a failed precondition (up to
    /// `conflict_retries` re-reads) and after a transient storage error
    /// (per the retry policy). It must read everything it conditions on.
    pub(crate) fn transact<R>(
        &self,
        what: &str,
        mut build: impl FnMut(&mut Txn) -> Result<R, PeopleError>,
    ) -> Result<R, PeopleError> {
        let mut last = String::new();
        for attempt in 0..=self.cfg.conflict_retries {
            let outcome = self.cfg.retry.run(what, || {
                let mut txn = Txn::new();
                let r = build(&mut txn)?;
                self.store.commit(txn)?;
                Ok(r)
            });
            match outcome {
                Err(PeopleError::Conflict(key)) => {
                    tracing::debug!(attempt, key = %key, "people: {what} lost a race, re-reading");
                    last = key;
                }
                other => return other,
            }
        }
        Err(PeopleError::Conflict(last))
    }

    /// [`Engine::transact`] on one existing person.
    pub(crate) fn with_person<R>(
        &self,
        what: &str,
        id: &str,
        mut build: impl FnMut(&mut Txn, &Versioned<Person>) -> Result<R, PeopleError>,
    ) -> Result<R, PeopleError> {
        self.transact(what, |txn| {
            let person = self.require_person(id)?;
            build(txn, &person)
        })
    }

    pub(crate) fn require_person(&self, id: &str) -> Result<Versioned<Person>, PeopleError> {
        self.store
            .person(id)?
            .ok_or_else(|| PeopleError::NotFound(format!("person {id}")))
    }
}
