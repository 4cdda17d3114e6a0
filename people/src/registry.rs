//! User-level operations on persons, faces and photo associations.

use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::PeopleError;
use crate::keys::NAME_PREFIX;
use crate::progress::{CancelToken, Milestones, Progress};
use crate::store::{Txn, Versioned};
use crate::types::{Diagnosis, Face, FaceInput, Person, PersonSummary};

/// Highest-confidence face's photo, else the first associated photo.
/// Photos equal to `exclude` are never picked.
fn pick_avatar(faces: &[Versioned<Face>], photos: &[String], exclude: Option<&str>) -> Option<String> {
    let allowed = |p: &str| Some(p) != exclude;
    faces
        .iter()
        .map(|f| &f.value)
        .filter(|f| allowed(f.photo_id.as_str()))
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map(|f| f.photo_id.clone())
        .or_else(|| photos.iter().find(|p| allowed(p.as_str())).cloned())
}

fn validate_name(name: &str) -> Result<&str, PeopleError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PeopleError::InvalidArgument("name must not be empty".into()));
    }
    Ok(name)
}

impl Engine {
    fn validate_input(&self, i: usize, input: &FaceInput) -> Result<(), PeopleError> {
        if input.photo_id.is_empty() || input.photo_id.contains(':') {
            return Err(PeopleError::InvalidArgument(format!(
                "face {i}: photo id {:?} must be non-empty and free of ':'",
                input.photo_id
            )));
        }
        if let Some(e) = &input.embedding {
            if e.len() != self.cfg.dim {
                return Err(PeopleError::DimensionMismatch {
                    expected: self.cfg.dim,
                    got: e.len(),
                });
            }
            if e.iter().any(|x| !x.is_finite()) {
                return Err(PeopleError::InvalidArgument(format!(
                    "face {i}: embedding has non-finite components"
                )));
            }
        }
        Ok(())
    }

    /// Store upstream detections as unlabeled faces. All inputs are
    /// validated before anything is written; returns the new face ids.
    pub fn ingest_faces(&self, inputs: &[FaceInput]) -> Result<Vec<String>, PeopleError> {
        for (i, input) in inputs.iter().enumerate() {
            self.validate_input(i, input)?;
        }
        let now = Utc::now();
        let faces: Vec<Face> = inputs
            .iter()
            .map(|input| Face {
                id: Uuid::new_v4().to_string(),
                photo_id: input.photo_id.clone(),
                bbox: input.bbox,
                confidence: input.confidence,
                embedding: input.embedding.clone(),
                timestamp: input.timestamp,
                person_id: None,
                created_at: now,
            })
            .collect();

        self.transact("ingest faces", |txn| {
            for face in &faces {
                txn.put_face(None, face);
            }
            Ok(())
        })?;
        tracing::info!(count = faces.len(), "people: faces ingested");
        Ok(faces.into_iter().map(|f| f.id).collect())
    }

    /// Delete every face of `photo_id` and every association to it.
    /// Persons whose avatar was that photo get a new one.
    pub fn forget_photo(&self, photo_id: &str) -> Result<usize, PeopleError> {
        let removed = self.transact("forget photo", |txn| {
            let mut faces = Vec::new();
            for id in self.store.photo_face_ids(photo_id)? {
                if let Some(f) = self.store.face(&id)? {
                    faces.push(f);
                }
            }
            let mut affected: BTreeSet<String> =
                self.store.photo_holders(photo_id)?.into_iter().collect();
            affected.extend(faces.iter().filter_map(|f| f.value.person_id.clone()));

            for f in &faces {
                txn.delete_face(f);
            }
            for pid in &affected {
                let Some(person) = self.store.person(pid)? else {
                    continue;
                };
                txn.remove_photo(pid, photo_id);
                if person.value.avatar_photo_id.as_deref() == Some(photo_id) {
                    let remaining = self.store.person_faces(pid)?;
                    let photos = self.store.person_photo_ids(pid)?;
                    txn.touch(&person).avatar_photo_id =
                        pick_avatar(&remaining, &photos, Some(photo_id));
                } else {
                    txn.touch(&person);
                }
            }
            Ok(faces.len())
        })?;
        tracing::info!(photo_id, removed, "people: photo forgotten");
        Ok(removed)
    }

    /// Create a person with a user-chosen name.
    pub fn create_person(&self, name: &str) -> Result<Person, PeopleError> {
        let name = validate_name(name)?;
        let person = Person {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            avatar_photo_id: None,
            hidden: false,
            starred: false,
            cluster_id: None,
            created_at: Utc::now(),
            revision: 0,
        };
        let placeholder = self.cfg.is_placeholder(name);
        if placeholder && self.store.name_owner(name)?.is_some() {
            return Err(PeopleError::InvalidArgument(format!("name {name} is taken")));
        }
        self.cfg
            .retry
            .run("create person", || {
                let mut txn = Txn::new();
                if placeholder {
                    txn.reserve_name(name, &person.id);
                }
                txn.create(person.clone());
                self.store.commit(txn)
            })
            .map_err(|e| match e {
                PeopleError::Conflict(key) if key.starts_with(NAME_PREFIX) => {
                    PeopleError::InvalidArgument(format!("name {name} is taken"))
                }
                e => e,
            })?;
        tracing::info!(person_id = %person.id, name, "people: person created");
        self.get_person(&person.id)
    }

    pub fn get_person(&self, id: &str) -> Result<Person, PeopleError> {
        Ok(self.require_person(id)?.value)
    }

    /// Rename a person. Placeholder-pattern names are reserved and must be
    /// free; renaming away from a placeholder releases it.
    pub fn rename_person(&self, id: &str, name: &str) -> Result<Person, PeopleError> {
        let name = validate_name(name)?;
        let reserve = self.cfg.is_placeholder(name);
        self.with_person("rename person", id, |txn, person| {
            let old = &person.value.name;
            if old == name {
                return Ok(());
            }
            if reserve {
                if let Some(owner) = self.store.name_owner(name)? {
                    if owner != id {
                        return Err(PeopleError::InvalidArgument(format!("name {name} is taken")));
                    }
                }
                txn.reserve_name(name, id);
            }
            if self.cfg.is_placeholder(old) {
                txn.release_name(old);
            }
            txn.touch(person).name = name.to_string();
            Ok(())
        })?;
        tracing::info!(person_id = id, name, "people: person renamed");
        self.get_person(id)
    }

    pub fn set_hidden(&self, id: &str, hidden: bool) -> Result<(), PeopleError> {
        self.with_person("set hidden", id, |txn, person| {
            if person.value.hidden != hidden {
                txn.touch(person).hidden = hidden;
            }
            Ok(())
        })
    }

    pub fn set_starred(&self, id: &str, starred: bool) -> Result<(), PeopleError> {
        self.with_person("set starred", id, |txn, person| {
            if person.value.starred != starred {
                txn.touch(person).starred = starred;
            }
            Ok(())
        })
    }

    /// Persons with face and photo counts: starred first, named before
    /// placeholder, more photos first, newest first.
    pub fn list_people(&self, include_hidden: bool) -> Result<Vec<PersonSummary>, PeopleError> {
        let mut out = self.cfg.retry.run("list persons", || {
            let mut out = Vec::new();
            for person in self.store.people()? {
                if person.hidden && !include_hidden {
                    continue;
                }
                let face_count = self.store.person_face_ids(&person.id)?.len();
                let photo_count = self.store.person_photo_ids(&person.id)?.len();
                out.push(PersonSummary {
                    placeholder: self.cfg.is_placeholder(&person.name),
                    person,
                    face_count,
                    photo_count,
                });
            }
            Ok(out)
        })?;
        out.sort_by(|a, b| {
            b.person
                .starred
                .cmp(&a.person.starred)
                .then(a.placeholder.cmp(&b.placeholder))
                .then(b.photo_count.cmp(&a.photo_count))
                .then(b.person.created_at.cmp(&a.person.created_at))
                .then(a.person.id.cmp(&b.person.id))
        });
        Ok(out)
    }

    pub fn person_faces(&self, id: &str) -> Result<Vec<Face>, PeopleError> {
        self.require_person(id)?;
        Ok(self
            .store
            .person_faces(id)?
            .into_iter()
            .map(|f| f.value)
            .collect())
    }

    pub fn person_photos(&self, id: &str) -> Result<Vec<String>, PeopleError> {
        self.require_person(id)?;
        self.store.person_photo_ids(id)
    }

    /// Use `photo_id` as the avatar. The photo must hold one of the
    /// person's faces.
    pub fn set_avatar(&self, id: &str, photo_id: &str) -> Result<(), PeopleError> {
        self.with_person("set avatar", id, |txn, person| {
            let faces = self.store.person_faces(id)?;
            if !faces.iter().any(|f| f.value.photo_id == photo_id) {
                return Err(PeopleError::InvalidArgument(format!(
                    "photo {photo_id} holds no face of person {id}"
                )));
            }
            if person.value.avatar_photo_id.as_deref() != Some(photo_id) {
                txn.touch(person).avatar_photo_id = Some(photo_id.to_string());
            }
            Ok(())
        })
    }

    /// Keep a valid avatar or pick one; returns the resulting avatar.
    pub fn ensure_avatar(&self, id: &str) -> Result<Option<String>, PeopleError> {
        self.with_person("ensure avatar", id, |txn, person| {
            let faces = self.store.person_faces(id)?;
            let photos = self.store.person_photo_ids(id)?;
            let current = person.value.avatar_photo_id.clone();
            if let Some(avatar) = &current {
                if faces.iter().any(|f| &f.value.photo_id == avatar) || photos.contains(avatar) {
                    return Ok(current);
                }
            }
            let picked = pick_avatar(&faces, &photos, None);
            if picked != current {
                txn.touch(person).avatar_photo_id = picked.clone();
            }
            Ok(picked)
        })
    }

    /// Unassign the person's faces in `photo_id` and drop the association.
    /// Returns how many faces were unassigned.
    pub fn detach_photo(&self, id: &str, photo_id: &str) -> Result<usize, PeopleError> {
        self.with_person("detach photo", id, |txn, person| {
            let faces = self.store.person_faces(id)?;
            let mut detached = 0;
            for f in faces.iter().filter(|f| f.value.photo_id == photo_id) {
                let mut after = f.value.clone();
                after.person_id = None;
                txn.put_face(Some(f), &after);
                detached += 1;
            }
            txn.remove_photo(id, photo_id);
            let p = txn.touch(person);
            if p.avatar_photo_id.as_deref() == Some(photo_id) {
                let photos = self.store.person_photo_ids(id)?;
                p.avatar_photo_id = pick_avatar(&faces, &photos, Some(photo_id));
            }
            Ok(detached)
        })
    }

    /// Delete a person, returning its faces to the unlabeled pool.
    pub fn release_person(&self, id: &str) -> Result<usize, PeopleError> {
        let released = self.with_person("release person", id, |txn, person| {
            let faces = self.store.person_faces(id)?;
            for f in &faces {
                let mut after = f.value.clone();
                after.person_id = None;
                txn.put_face(Some(f), &after);
            }
            self.detach_person(txn, person)?;
            Ok(faces.len())
        })?;
        tracing::info!(person_id = id, released, "people: person released");
        Ok(released)
    }

    /// Remove `person` with its associations, name reservation and edges,
    /// touching every neighbour. Faces are left to the caller.
    pub(crate) fn detach_person(
        &self,
        txn: &mut Txn,
        person: &Versioned<Person>,
    ) -> Result<(), PeopleError> {
        let id = &person.value.id;
        for photo in self.store.person_photo_ids(id)? {
            txn.remove_photo(id, &photo);
        }
        for other in self.store.ignored(id)? {
            if let Some(n) = self.store.person(&other)? {
                txn.touch(&n);
            }
            txn.remove_edge(id, &other);
        }
        if self.cfg.is_placeholder(&person.value.name) {
            txn.release_name(&person.value.name);
        }
        txn.remove_person(person);
        Ok(())
    }

    /// Associate every photo holding one of the person's faces. Returns how
    /// many associations were added.
    pub fn sync_photos(&self, id: &str) -> Result<usize, PeopleError> {
        self.with_person("sync photos", id, |txn, person| {
            let have: BTreeSet<String> = self.store.person_photo_ids(id)?.into_iter().collect();
            let want: BTreeSet<String> = self
                .store
                .person_faces(id)?
                .into_iter()
                .map(|f| f.value.photo_id)
                .collect();
            let missing: Vec<&String> = want.difference(&have).collect();
            if missing.is_empty() {
                return Ok(0);
            }
            for photo in &missing {
                txn.add_photo(id, photo);
            }
            txn.touch(person);
            Ok(missing.len())
        })
    }

    /// [`Engine::sync_photos`] for every person.
    pub(crate) fn sync_all_photos(
        &self,
        progress: &dyn Progress,
        cancel: &CancelToken,
    ) -> Result<usize, PeopleError> {
        let milestones = Milestones::new(progress);
        let people = self.cfg.retry.run("load persons", || self.store.people())?;
        let mut added = 0;
        for (i, person) in people.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PeopleError::Cancelled { completed: added });
            }
            match self.sync_photos(&person.id) {
                Ok(n) => added += n,
                Err(PeopleError::NotFound(_)) => {}
                Err(e) if e.is_per_item() => {
                    tracing::warn!(person_id = %person.id, error = %e, "people: photo sync skipped");
                }
                Err(e) => return Err(e),
            }
            milestones.report_fraction(0, 100, i + 1, people.len());
        }
        milestones.report(100);
        if added > 0 {
            tracing::info!(added, "people: photo associations synced");
        }
        Ok(added)
    }

    /// Compare a person's faces with its photo associations and avatar.
    pub fn diagnose_person(&self, id: &str) -> Result<Diagnosis, PeopleError> {
        let person = self.require_person(id)?.value;
        let faces = self.store.person_faces(id)?;
        let photos: BTreeSet<String> = self.store.person_photo_ids(id)?.into_iter().collect();
        let face_photos: BTreeSet<String> = faces.iter().map(|f| f.value.photo_id.clone()).collect();

        let avatar_valid = match &person.avatar_photo_id {
            Some(a) => face_photos.contains(a),
            None => faces.is_empty(),
        };
        let diagnosis = Diagnosis {
            person_id: id.to_string(),
            face_count: faces.len(),
            photo_count: photos.len(),
            missing_associations: face_photos.difference(&photos).cloned().collect(),
            associations_without_faces: photos.difference(&face_photos).cloned().collect(),
            avatar_valid,
        };
        if !diagnosis.is_consistent() {
            tracing::warn!(
                person_id = id,
                missing = diagnosis.missing_associations.len(),
                avatar_valid,
                "people: person is inconsistent"
            );
        }
        Ok(diagnosis)
    }
}
