//! Discovery of new persons among faces no existing person claims.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use uuid::Uuid;

use crate::dbscan::{NOISE, dbscan};
use crate::engine::Engine;
use crate::error::PeopleError;
use crate::keys::NAME_PREFIX;
use crate::progress::{CancelToken, Milestones, Progress};
use crate::store::Txn;
use crate::types::Person;
use crate::vector::l2_normalize;

/// Upper bound on commit attempts for one new person.
const MAX_CREATE_ATTEMPTS: usize = 64;

/// A group of faces that becomes one person.
struct Group {
    cluster_id: Option<i64>,
    faces: Vec<String>,
}

impl Engine {
    fn load_unlabeled(&self) -> Result<(Vec<String>, Vec<Vec<f32>>), PeopleError> {
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        self.store.for_each_face(|face| {
            if face.person_id.is_some() {
                return;
            }
            if let Some(mut v) = face.embedding {
                l2_normalize(&mut v);
                ids.push(face.id);
                vectors.push(v);
            }
        })?;
        Ok((ids, vectors))
    }

    /// Cluster unlabeled faces with DBSCAN and create one placeholder-named
    /// person per cluster and per noise face. Returns the number of faces
    /// assigned.
    ///
    /// Clusters that ended up smaller than `min_samples` (their neighbours
    /// were claimed by an earlier cluster) are split into singletons.
    pub fn discover_clusters(
        &self,
        eps: f32,
        min_samples: usize,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<usize, PeopleError> {
        let milestones = Milestones::new(progress);
        milestones.report(0);

        let (ids, vectors) = self.cfg.retry.run("load unlabeled faces", || self.load_unlabeled())?;
        milestones.report(10);
        if ids.is_empty() {
            milestones.report(100);
            return Ok(0);
        }

        let labels = dbscan(&vectors, eps, min_samples)?;
        drop(vectors);
        milestones.report(40);

        let mut clusters: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        let mut groups = Vec::new();
        for (id, label) in ids.into_iter().zip(labels) {
            if label == NOISE {
                groups.push(Group {
                    cluster_id: None,
                    faces: vec![id],
                });
            } else {
                clusters.entry(label).or_default().push(id);
            }
        }
        let noise = groups.len();
        let cluster_count = clusters.len();
        let mut cluster_groups = Vec::new();
        for (label, faces) in clusters {
            if faces.len() >= min_samples {
                cluster_groups.push(Group {
                    cluster_id: Some(label as i64),
                    faces,
                });
            } else {
                cluster_groups.extend(faces.into_iter().map(|f| Group {
                    cluster_id: None,
                    faces: vec![f],
                }));
            }
        }
        cluster_groups.append(&mut groups);
        tracing::info!(clusters = cluster_count, noise, "people: clustering finished");

        let mut assigned = 0;
        for (i, group) in cluster_groups.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(assigned, "people: discovery cancelled");
                return Err(PeopleError::Cancelled { completed: assigned });
            }
            match self.create_identity(&group.faces, group.cluster_id) {
                Ok(n) => assigned += n,
                Err(e) if e.is_per_item() => {
                    tracing::warn!(cluster_id = ?group.cluster_id, error = %e, "people: cluster skipped");
                }
                Err(e) => return Err(e),
            }
            milestones.report_fraction(40, 100, i + 1, cluster_groups.len());
        }

        milestones.report(100);
        tracing::info!(assigned, persons = cluster_groups.len(), "people: discovery finished");
        Ok(assigned)
    }

    /// Lowest placeholder suffix that is neither reserved nor known taken.
    fn next_placeholder(&self, tried: &BTreeSet<u64>) -> Result<u64, PeopleError> {
        let used: BTreeSet<u64> = self
            .store
            .reserved_names(&self.cfg.placeholder_prefix)?
            .iter()
            .filter_map(|name| self.cfg.placeholder_suffix(name))
            .chain(tried.iter().copied())
            .collect();
        Ok((1..).find(|n| !used.contains(n)).unwrap_or(1))
    }

    /// Create a placeholder person owning whichever of `members` are still
    /// unlabeled. Returns how many faces it received.
    fn create_identity(&self, members: &[String], cluster_id: Option<i64>) -> Result<usize, PeopleError> {
        let mut tried = BTreeSet::new();
        let mut last = String::new();
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let mut suffix = None;
            let outcome = self.cfg.retry.run("create person", || {
                let mut faces = Vec::new();
                for id in members {
                    if let Some(f) = self.store.face(id)? {
                        if f.value.person_id.is_none() {
                            faces.push(f);
                        }
                    }
                }
                let Some(first) = faces.first() else {
                    return Ok(None);
                };

                let n = self.next_placeholder(&tried)?;
                suffix = Some(n);
                let person = Person {
                    id: Uuid::new_v4().to_string(),
                    name: self.cfg.placeholder_name(n),
                    avatar_photo_id: Some(first.value.photo_id.clone()),
                    hidden: false,
                    starred: false,
                    cluster_id,
                    created_at: Utc::now(),
                    revision: 0,
                };

                let mut txn = Txn::new();
                txn.reserve_name(&person.name, &person.id);
                for f in &faces {
                    let mut after = f.value.clone();
                    after.person_id = Some(person.id.clone());
                    txn.put_face(Some(f), &after);
                    txn.add_photo(&person.id, &after.photo_id);
                }
                let id = person.id.clone();
                let name = person.name.clone();
                txn.create(person);
                self.store.commit(txn)?;
                Ok(Some((id, name, faces.len())))
            });

            match outcome {
                Ok(Some((id, name, count))) => {
                    tracing::debug!(person_id = %id, name = %name, faces = count, "people: person discovered");
                    return Ok(count);
                }
                Ok(None) => return Ok(0),
                Err(PeopleError::Conflict(key)) => {
                    if key.starts_with(NAME_PREFIX) {
                        if let Some(n) = suffix {
                            tried.insert(n);
                        }
                        tracing::debug!(key = %key, "people: placeholder name taken, trying next");
                    } else {
                        tracing::debug!(key = %key, "people: face claimed concurrently, re-reading");
                    }
                    last = key;
                }
                Err(e) => return Err(e),
            }
        }
        Err(PeopleError::Conflict(last))
    }
}
