//! Assignment of unlabeled faces to existing persons.

use std::collections::{BTreeMap, BTreeSet};

use crate::engine::Engine;
use crate::error::PeopleError;
use crate::progress::{CancelToken, Milestones, Progress};
use crate::vector::{cosine_distance, multi_centroid, norm};

/// Upper bound on re-matching rounds within one pass.
const MAX_MATCH_ROUNDS: usize = 8;

/// An unlabeled face awaiting a match.
struct Candidate {
    face_id: String,
    embedding: Vec<f32>,
}

/// Closest person to `embedding` among `reps`, with its distance. Iterates
/// persons in id order and keeps the first on ties.
fn nearest_person<'a>(
    embedding: &[f32],
    reps: &'a BTreeMap<String, Vec<Vec<f32>>>,
) -> Option<(&'a str, f32)> {
    let mut best: Option<(&str, f32)> = None;
    for (person, centers) in reps {
        for center in centers {
            let Ok(d) = cosine_distance(embedding, center) else {
                continue;
            };
            if best.is_none_or(|(_, b)| d < b) {
                best = Some((person, d));
            }
        }
    }
    best
}

impl Engine {
    fn load_match_inputs(
        &self,
    ) -> Result<(Vec<Candidate>, BTreeMap<String, Vec<Vec<f32>>>), PeopleError> {
        let mut candidates = Vec::new();
        let mut members: BTreeMap<String, Vec<Vec<f32>>> = BTreeMap::new();
        self.store.for_each_face(|face| {
            let Some(embedding) = face.embedding else {
                return;
            };
            match face.person_id {
                Some(person) => members.entry(person).or_default().push(embedding),
                None => candidates.push(Candidate {
                    face_id: face.id,
                    embedding,
                }),
            }
        })?;

        let reps = members
            .into_iter()
            .map(|(person, vectors)| (person, multi_centroid(&vectors, self.cfg.max_centroids)))
            .collect();
        Ok((candidates, reps))
    }

    /// Assign each unlabeled face to the person whose nearest representative
    /// vector is closer than `threshold`. Returns the number assigned.
    ///
    /// Persons are represented by up to `max_centroids` centers of their
    /// current faces. Assignments move those centers, so the pass repeats
    /// over the persons present at its start until a round assigns nothing
    /// (bounded by `MAX_MATCH_ROUNDS`). A face whose person disappears
    /// before commit stays unlabeled.
    pub fn match_unlabeled_faces(
        &self,
        threshold: f32,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<usize, PeopleError> {
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 2.0 {
            return Err(PeopleError::InvalidArgument(format!(
                "match threshold must be in (0, 2], got {threshold}"
            )));
        }
        let milestones = Milestones::new(progress);
        milestones.report(0);

        let mut assigned = 0;
        let mut known: Option<BTreeSet<String>> = None;
        for round in 0..MAX_MATCH_ROUNDS {
            let (candidates, mut reps) =
                self.cfg.retry.run("load faces", || self.load_match_inputs())?;
            match &known {
                Some(known) => reps.retain(|person, _| known.contains(person)),
                None => known = Some(reps.keys().cloned().collect()),
            }
            if round == 0 {
                milestones.report(10);
            }
            tracing::debug!(
                round,
                candidates = candidates.len(),
                persons = reps.len(),
                "people: matching unlabeled faces"
            );

            let mut round_assigned = 0;
            for (i, c) in candidates.iter().enumerate() {
                if cancel.is_cancelled() {
                    let completed = assigned + round_assigned;
                    tracing::info!(assigned = completed, "people: matching cancelled");
                    return Err(PeopleError::Cancelled { completed });
                }
                if round == 0 {
                    milestones.report_fraction(10, 90, i, candidates.len());
                }

                if norm(&c.embedding) == 0.0 {
                    tracing::debug!(face_id = %c.face_id, error = %PeopleError::DegenerateVector, "people: face skipped");
                    continue;
                }
                let Some((person, distance)) = nearest_person(&c.embedding, &reps) else {
                    continue;
                };
                if distance >= threshold {
                    continue;
                }
                match self.assign_face(&c.face_id, person) {
                    Ok(true) => round_assigned += 1,
                    Ok(false) => {
                        tracing::debug!(face_id = %c.face_id, "people: face labeled concurrently");
                    }
                    Err(e) if e.is_per_item() => {
                        tracing::warn!(face_id = %c.face_id, person_id = person, error = %e, "people: face left unassigned");
                    }
                    Err(e) => return Err(e),
                }
            }

            assigned += round_assigned;
            if round_assigned == 0 {
                break;
            }
        }

        milestones.report(100);
        tracing::info!(assigned, threshold, "people: matching finished");
        Ok(assigned)
    }

    /// Point a still-unlabeled face at `person_id`, associate its photo and
    /// fill in a missing avatar in one transaction. Returns false when the
    /// face was deleted or labeled in the meantime.
    pub(crate) fn assign_face(&self, face_id: &str, person_id: &str) -> Result<bool, PeopleError> {
        self.transact("assign face", |txn| {
            let Some(face) = self.store.face(face_id)? else {
                return Ok(false);
            };
            if face.value.person_id.is_some() {
                return Ok(false);
            }
            let person = self
                .store
                .person(person_id)?
                .ok_or_else(|| PeopleError::StaleReference(format!("person {person_id}")))?;

            let mut after = face.value.clone();
            after.person_id = Some(person_id.to_string());
            txn.put_face(Some(&face), &after);
            txn.add_photo(person_id, &after.photo_id);
            let p = txn.touch(&person);
            if p.avatar_photo_id.is_none() {
                p.avatar_photo_id = Some(after.photo_id.clone());
            }
            Ok(true)
        })
    }
}
