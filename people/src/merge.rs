use std::collections::BTreeSet;

use crate::engine::Engine;
use crate::error::PeopleError;
use crate::store::Txn;
use crate::types::MergeOutcome;

impl Engine {
    /// Fold `source_id` into `target_id` and delete the source.
    ///
    /// Everything happens in one conditional transaction guarded by the
    /// exact stored bytes of both persons, every moved face and every
    /// touched neighbour. If either person is missing, at invocation or by
    /// commit time, the result is [`PeopleError::StaleReference`] and
    /// nothing is written; any other concurrent change yields
    /// [`PeopleError::Conflict`]. Transient storage errors are not retried
    /// here.
    pub fn merge(&self, source_id: &str, target_id: &str) -> Result<MergeOutcome, PeopleError> {
        if source_id == target_id {
            return Ok(MergeOutcome {
                source: source_id.to_string(),
                target: target_id.to_string(),
                ..Default::default()
            });
        }
        let stale = |id: &str| PeopleError::StaleReference(format!("person {id}"));
        let source = self.store.person(source_id)?.ok_or_else(|| stale(source_id))?;
        let target = self.store.person(target_id)?.ok_or_else(|| stale(target_id))?;

        let mut txn = Txn::new();
        let mut outcome = MergeOutcome {
            source: source_id.to_string(),
            target: target_id.to_string(),
            ..Default::default()
        };

        for face in self.store.person_faces(source_id)? {
            let mut after = face.value.clone();
            after.person_id = Some(target_id.to_string());
            txn.put_face(Some(&face), &after);
            outcome.faces_moved += 1;
        }

        let target_photos: BTreeSet<String> =
            self.store.person_photo_ids(target_id)?.into_iter().collect();
        for photo in self.store.person_photo_ids(source_id)? {
            if !target_photos.contains(&photo) {
                txn.add_photo(target_id, &photo);
                outcome.photos_added += 1;
            }
        }

        let t = txn.touch(&target);
        if t.avatar_photo_id.is_none() {
            t.avatar_photo_id = source.value.avatar_photo_id.clone();
        }

        let target_edges: BTreeSet<String> = self.store.ignored(target_id)?.into_iter().collect();
        for other in self.store.ignored(source_id)? {
            if other == target_id || target_edges.contains(&other) {
                continue;
            }
            // Dangling edges are dropped with the source below.
            if let Some(n) = self.store.person(&other)? {
                txn.touch(&n);
                txn.add_edge(target_id, &other);
            }
        }

        // Source photo rows, edges and name go with it.
        self.detach_person(&mut txn, &source)?;

        match self.store.commit(txn) {
            Ok(()) => {
                tracing::info!(
                    source = source_id,
                    target = target_id,
                    faces = outcome.faces_moved,
                    photos = outcome.photos_added,
                    "people: persons merged"
                );
                Ok(outcome)
            }
            Err(PeopleError::Conflict(key)) => {
                for id in [source_id, target_id] {
                    if self.store.person(id)?.is_none() {
                        return Err(stale(id));
                    }
                }
                Err(PeopleError::Conflict(key))
            }
            Err(e) => Err(e),
        }
    }
}
