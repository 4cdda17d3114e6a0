//! Typed records over the KV store and narrow conditional transactions.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use photoid_kv::{Batch, Expect, KVError, KVStore};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PeopleError;
use crate::ignore::PersonPair;
use crate::keys::*;
use crate::types::{Face, Person};

/// A decoded record together with the exact bytes it was decoded from.
/// The bytes become the precondition of any transaction that rewrites it.
#[derive(Debug, Clone)]
pub(crate) struct Versioned<T> {
    pub value: T,
    pub raw: Vec<u8>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PeopleError> {
    rmp_serde::to_vec_named(value).map_err(|e| PeopleError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, PeopleError> {
    rmp_serde::from_slice(raw).map_err(|e| PeopleError::Serialization(e.to_string()))
}

/// Read access to faces, persons and their indexes.
#[derive(Clone)]
pub(crate) struct Store {
    kv: Arc<dyn KVStore>,
}

impl Store {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<Versioned<T>>, PeopleError> {
        match self.kv.get(key)? {
            Some(raw) => Ok(Some(Versioned {
                value: decode(&raw)?,
                raw,
            })),
            None => Ok(None),
        }
    }

    /// Collect the last key segment of every entry under `prefix`.
    fn suffixes(&self, prefix: &str) -> Result<Vec<String>, PeopleError> {
        let mut out = Vec::new();
        self.kv.for_each(prefix, &mut |key, _| {
            if let Some(rest) = suffix(key, prefix) {
                out.push(rest.to_string());
            }
            true
        })?;
        Ok(out)
    }

    pub fn person(&self, id: &str) -> Result<Option<Versioned<Person>>, PeopleError> {
        self.load(&person_key(id))
    }

    pub fn face(&self, id: &str) -> Result<Option<Versioned<Face>>, PeopleError> {
        self.load(&face_key(id))
    }

    /// Every person, ordered by id.
    pub fn people(&self) -> Result<Vec<Person>, PeopleError> {
        self.kv
            .scan(PERSON_PREFIX)?
            .iter()
            .map(|(_, raw)| decode(raw))
            .collect()
    }

    pub fn person_face_ids(&self, person: &str) -> Result<Vec<String>, PeopleError> {
        self.suffixes(&person_faces_prefix(person))
    }

    /// The person's faces, loaded through the `fp:` index. Entries whose
    /// face no longer points at the person are dropped.
    pub fn person_faces(&self, person: &str) -> Result<Vec<Versioned<Face>>, PeopleError> {
        let mut faces = Vec::new();
        for id in self.person_face_ids(person)? {
            if let Some(face) = self.face(&id)? {
                if face.value.person_id.as_deref() == Some(person) {
                    faces.push(face);
                }
            }
        }
        Ok(faces)
    }

    pub fn person_photo_ids(&self, person: &str) -> Result<Vec<String>, PeopleError> {
        self.suffixes(&person_photos_prefix(person))
    }

    pub fn photo_face_ids(&self, photo: &str) -> Result<Vec<String>, PeopleError> {
        self.suffixes(&photo_faces_prefix(photo))
    }

    /// Persons holding an association to `photo`.
    pub fn photo_holders(&self, photo: &str) -> Result<Vec<String>, PeopleError> {
        let mut out = Vec::new();
        self.kv.for_each(PERSON_PHOTO_PREFIX, &mut |key, _| {
            if let Some((person, p)) = suffix(key, PERSON_PHOTO_PREFIX).and_then(split_pair) {
                if p == photo {
                    out.push(person.to_string());
                }
            }
            true
        })?;
        Ok(out)
    }

    /// Persons the given person must not be merged with.
    pub fn ignored(&self, person: &str) -> Result<Vec<String>, PeopleError> {
        self.suffixes(&ignore_prefix(person))
    }

    pub fn all_ignored_pairs(&self) -> Result<BTreeSet<PersonPair>, PeopleError> {
        let mut out = BTreeSet::new();
        self.kv.for_each(IGNORE_PREFIX, &mut |key, _| {
            if let Some((a, b)) = suffix(key, IGNORE_PREFIX).and_then(split_pair) {
                if let Some(pair) = PersonPair::new(a, b) {
                    out.insert(pair);
                }
            }
            true
        })?;
        Ok(out)
    }

    /// Stream every stored face without collecting them.
    pub fn for_each_face(&self, mut visit: impl FnMut(Face)) -> Result<(), PeopleError> {
        let mut failure = None;
        self.kv.for_each(FACE_PREFIX, &mut |_, raw| match decode::<Face>(raw) {
            Ok(face) => {
                visit(face);
                true
            }
            Err(e) => {
                failure = Some(e);
                false
            }
        })?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The person holding a name reservation, if any.
    pub fn name_owner(&self, name: &str) -> Result<Option<String>, PeopleError> {
        Ok(self
            .kv
            .get(&name_key(name))?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Names currently reserved under `prefix`.
    pub fn reserved_names(&self, prefix: &str) -> Result<Vec<String>, PeopleError> {
        self.suffixes(&name_key(prefix))
            .map(|rest| rest.into_iter().map(|r| format!("{prefix}{r}")).collect())
    }

    /// Apply `txn` atomically. A failed precondition surfaces as
    /// [`PeopleError::Conflict`] naming the key.
    pub fn commit(&self, txn: Txn) -> Result<(), PeopleError> {
        if txn.is_empty() {
            return Ok(());
        }
        let batch = txn.into_batch()?;
        self.kv.commit(&batch).map_err(|e| match e {
            KVError::Conflict(key) => PeopleError::Conflict(key),
            other => PeopleError::Storage(other),
        })
    }
}

/// Builds one conditional batch.
///
/// Every person passed through [`Txn::touch`] or [`Txn::create`] is written
/// once at commit with its revision bumped, guarded by its exact prior bytes
/// (or by absence for a new person).
#[derive(Debug, Default)]
pub(crate) struct Txn {
    batch: Batch,
    updates: BTreeMap<String, Person>,
    faces: BTreeMap<String, Face>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.updates.is_empty() && self.faces.is_empty()
    }

    /// Condition the batch on `person` and return the copy that will be
    /// written. A person already in the transaction keeps its first
    /// precondition and pending changes.
    pub fn touch(&mut self, person: &Versioned<Person>) -> &mut Person {
        match self.updates.entry(person.value.id.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.batch
                    .expect(person_key(e.key()), Expect::Equals(person.raw.clone()));
                e.insert(person.value.clone())
            }
        }
    }

    pub fn create(&mut self, person: Person) -> &mut Person {
        let id = person.id.clone();
        self.batch.expect(person_key(&id), Expect::Absent);
        self.updates.entry(id).or_insert(person)
    }

    /// Delete the person record. Faces, photo associations and edges must be
    /// detached separately.
    pub fn remove_person(&mut self, person: &Versioned<Person>) {
        let id = &person.value.id;
        self.batch
            .expect(person_key(id), Expect::Equals(person.raw.clone()));
        self.updates.remove(id);
        self.batch.delete(person_key(id));
    }

    /// Write `after`, guarded by `before` (or by absence for a new face),
    /// keeping the person and photo indexes in step.
    pub fn put_face(&mut self, before: Option<&Versioned<Face>>, after: &Face) {
        let key = face_key(&after.id);
        match before {
            Some(b) => {
                self.batch.expect(key.clone(), Expect::Equals(b.raw.clone()));
                if let Some(old) = &b.value.person_id {
                    if after.person_id.as_ref() != Some(old) {
                        self.batch.delete(person_face_key(old, &after.id));
                    }
                }
            }
            None => {
                self.batch.expect(key.clone(), Expect::Absent);
                self.batch
                    .put(photo_face_key(&after.photo_id, &after.id), Vec::new());
            }
        }
        if let Some(person) = &after.person_id {
            self.batch.put(person_face_key(person, &after.id), Vec::new());
        }
        self.faces.insert(after.id.clone(), after.clone());
    }

    pub fn delete_face(&mut self, face: &Versioned<Face>) {
        let f = &face.value;
        self.faces.remove(&f.id);
        self.batch
            .expect(face_key(&f.id), Expect::Equals(face.raw.clone()));
        self.batch.delete(face_key(&f.id));
        self.batch.delete(photo_face_key(&f.photo_id, &f.id));
        if let Some(person) = &f.person_id {
            self.batch.delete(person_face_key(person, &f.id));
        }
    }

    pub fn add_photo(&mut self, person: &str, photo: &str) {
        self.batch.put(person_photo_key(person, photo), Vec::new());
    }

    pub fn remove_photo(&mut self, person: &str, photo: &str) {
        self.batch.delete(person_photo_key(person, photo));
    }

    /// Record the undirected edge in both directions.
    pub fn add_edge(&mut self, a: &str, b: &str) {
        self.batch.put(ignore_key(a, b), Vec::new());
        self.batch.put(ignore_key(b, a), Vec::new());
    }

    pub fn remove_edge(&mut self, a: &str, b: &str) {
        self.batch.delete(ignore_key(a, b));
        self.batch.delete(ignore_key(b, a));
    }

    /// Claim `name` for `person`; the commit fails if it is already held.
    pub fn reserve_name(&mut self, name: &str, person: &str) {
        let key = name_key(name);
        self.batch.expect(key.clone(), Expect::Absent);
        self.batch.put(key, person.as_bytes());
    }

    pub fn release_name(&mut self, name: &str) {
        self.batch.delete(name_key(name));
    }

    fn into_batch(mut self) -> Result<Batch, PeopleError> {
        for (id, face) in &self.faces {
            self.batch.put(face_key(id), encode(face)?);
        }
        for (id, mut person) in self.updates {
            person.revision += 1;
            self.batch.put(person_key(&id), encode(&person)?);
        }
        Ok(self.batch)
    }
}
