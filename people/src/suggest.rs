//! Near-duplicate detection between persons.

use std::collections::BTreeMap;

use crate::engine::Engine;
use crate::error::PeopleError;
use crate::ignore::PersonPair;
use crate::types::{MergeSuggestion, SimilarPerson};
use crate::vector::cosine_distance;

/// `round((1 - distance) * 100, 1)`.
pub(crate) fn confidence(distance: f32) -> f64 {
    ((1.0 - distance as f64) * 1000.0).round() / 10.0
}

/// Running per-person totals built while streaming faces.
#[derive(Default)]
struct Aggregate {
    sum: Vec<f64>,
    embedded: usize,
    faces: usize,
}

impl Aggregate {
    fn add(&mut self, embedding: Option<&[f32]>) {
        self.faces += 1;
        let Some(e) = embedding else {
            return;
        };
        if self.sum.is_empty() {
            self.sum = vec![0.0; e.len()];
        }
        if self.sum.len() != e.len() {
            return;
        }
        for (s, &x) in self.sum.iter_mut().zip(e) {
            *s += x as f64;
        }
        self.embedded += 1;
    }

    fn mean(&self) -> Option<Vec<f32>> {
        if self.embedded == 0 {
            return None;
        }
        let n = self.embedded as f64;
        Some(self.sum.iter().map(|s| (s / n) as f32).collect())
    }
}

/// A person's mean embedding and face count.
struct Profile {
    mean: Option<Vec<f32>>,
    faces: usize,
}

fn check_threshold(threshold: f32) -> Result<(), PeopleError> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 2.0 {
        return Err(PeopleError::InvalidArgument(format!(
            "threshold must be in (0, 2], got {threshold}"
        )));
    }
    Ok(())
}

impl Engine {
    /// Mean embedding per person, streamed over all stored faces.
    fn profiles(&self) -> Result<BTreeMap<String, Profile>, PeopleError> {
        let mut totals: BTreeMap<String, Aggregate> = BTreeMap::new();
        self.store.for_each_face(|face| {
            if let Some(person) = face.person_id {
                totals
                    .entry(person)
                    .or_default()
                    .add(face.embedding.as_deref());
            }
        })?;
        Ok(totals
            .into_iter()
            .map(|(id, agg)| {
                (
                    id,
                    Profile {
                        mean: agg.mean(),
                        faces: agg.faces,
                    },
                )
            })
            .collect())
    }

    /// Pairs of visible, non-dismissed persons whose mean embeddings are
    /// closer than `threshold`, ascending by distance then ids.
    pub fn suggest_merges(&self, threshold: f32) -> Result<Vec<MergeSuggestion>, PeopleError> {
        check_threshold(threshold)?;
        let retry = &self.cfg.retry;
        let people: BTreeMap<String, _> = retry
            .run("load persons", || self.store.people())?
            .into_iter()
            .filter(|p| !p.hidden)
            .map(|p| (p.id.clone(), p))
            .collect();
        let profiles = retry.run("load profiles", || self.profiles())?;
        let ignored = retry.run("load dismissed pairs", || self.store.all_ignored_pairs())?;

        let mut means: Vec<(&str, &[f32], usize)> = Vec::new();
        for (id, profile) in &profiles {
            if !people.contains_key(id) {
                continue;
            }
            let Some(mean) = &profile.mean else {
                continue;
            };
            if mean.iter().all(|&x| x == 0.0) {
                tracing::debug!(person_id = %id, "people: degenerate mean embedding, skipped");
                continue;
            }
            means.push((id.as_str(), mean.as_slice(), profile.faces));
        }

        let mut out = Vec::new();
        for (i, &(a, va, faces_a)) in means.iter().enumerate() {
            for &(b, vb, faces_b) in &means[i + 1..] {
                if PersonPair::new(a, b).is_some_and(|pair| ignored.contains(&pair)) {
                    continue;
                }
                let distance = match cosine_distance(va, vb) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::debug!(a, b, error = %e, "people: pair skipped");
                        continue;
                    }
                };
                if distance >= threshold {
                    continue;
                }
                let (pa, pb) = (&people[a], &people[b]);
                out.push(MergeSuggestion {
                    person_a: a.to_string(),
                    person_b: b.to_string(),
                    distance,
                    confidence: confidence(distance),
                    name_a: pa.name.clone(),
                    name_b: pb.name.clone(),
                    placeholder_a: self.cfg.is_placeholder(&pa.name),
                    placeholder_b: self.cfg.is_placeholder(&pb.name),
                    faces_a,
                    faces_b,
                });
            }
        }

        out.sort_by(|x, y| {
            x.distance
                .total_cmp(&y.distance)
                .then_with(|| x.person_a.cmp(&y.person_a))
                .then_with(|| x.person_b.cmp(&y.person_b))
        });
        tracing::info!(count = out.len(), threshold, "people: merge suggestions computed");
        Ok(out)
    }

    /// Visible, non-dismissed persons within `threshold` of `id`, nearest
    /// first. Empty when `id` has no embedded faces.
    pub fn similar_to(&self, id: &str, threshold: f32) -> Result<Vec<SimilarPerson>, PeopleError> {
        check_threshold(threshold)?;
        let retry = &self.cfg.retry;
        retry.run("load person", || self.require_person(id))?;
        let profiles = retry.run("load profiles", || self.profiles())?;
        let Some(target) = profiles.get(id).and_then(|p| p.mean.as_ref()) else {
            return Ok(Vec::new());
        };
        let ignored = retry.run("load dismissed pairs", || self.store.ignored(id))?;

        let mut out = Vec::new();
        for person in retry.run("load persons", || self.store.people())? {
            if person.id == id || person.hidden || ignored.contains(&person.id) {
                continue;
            }
            let Some(mean) = profiles.get(&person.id).and_then(|p| p.mean.as_ref()) else {
                continue;
            };
            let Ok(distance) = cosine_distance(target, mean) else {
                continue;
            };
            if distance < threshold {
                out.push(SimilarPerson {
                    person_id: person.id,
                    name: person.name,
                    distance,
                    confidence: confidence(distance),
                });
            }
        }
        out.sort_by(|x, y| {
            x.distance
                .total_cmp(&y.distance)
                .then_with(|| x.person_id.cmp(&y.person_id))
        });
        Ok(out)
    }
}
