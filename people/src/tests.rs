use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use photoid_kv::{Batch, KVError, KVResult, KVStore, MemoryStore, RedbStore};

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::PeopleError;
use crate::keys::person_key;
use crate::pipeline::PipelineOptions;
use crate::progress::{CancelToken, NoProgress};
use crate::retry::RetryPolicy;
use crate::types::FaceInput;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dim: usize) -> EngineConfig {
    EngineConfig {
        dim,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_ms: 0,
        },
        ..Default::default()
    }
}

fn engine_on(kv: Arc<dyn KVStore>, dim: usize) -> Engine {
    Engine::new(kv, config(dim)).unwrap()
}

fn engine(dim: usize) -> Engine {
    engine_on(Arc::new(MemoryStore::new()), dim)
}

fn face(photo: &str, embedding: &[f32]) -> FaceInput {
    FaceInput {
        photo_id: photo.into(),
        bbox: [0.0, 0.0, 32.0, 32.0],
        confidence: 0.9,
        embedding: Some(embedding.to_vec()),
        timestamp: None,
    }
}

fn one_hot(dim: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[i] = 1.0;
    v
}

/// Create a named person owning one face per embedding.
fn person_with(e: &Engine, name: &str, embeddings: &[Vec<f32>]) -> String {
    let person = e.create_person(name).unwrap();
    let inputs: Vec<FaceInput> = embeddings
        .iter()
        .enumerate()
        .map(|(i, v)| face(&format!("{name}-{i}"), v))
        .collect();
    for id in e.ingest_faces(&inputs).unwrap() {
        assert!(e.assign_face(&id, &person.id).unwrap());
    }
    person.id
}

fn person_of(e: &Engine, face_id: &str) -> Option<String> {
    e.store.face(face_id).unwrap().unwrap().value.person_id
}

/// Every face points at an existing person, the person index agrees with
/// the faces, and dismissed edges are symmetric between existing persons.
fn assert_consistent(e: &Engine) {
    let people: BTreeSet<String> = e.store.people().unwrap().into_iter().map(|p| p.id).collect();

    let mut owned: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    e.store
        .for_each_face(|f| {
            if let Some(p) = f.person_id {
                owned.entry(p).or_default().insert(f.id);
            }
        })
        .unwrap();
    for (person, faces) in &owned {
        assert!(people.contains(person), "face points at missing person {person}");
        let indexed: BTreeSet<String> = e.store.person_face_ids(person).unwrap().into_iter().collect();
        assert_eq!(&indexed, faces, "fp index of {person}");
    }
    for person in &people {
        if !owned.contains_key(person) {
            assert!(e.store.person_face_ids(person).unwrap().is_empty());
        }
    }

    for person in &people {
        for other in e.store.ignored(person).unwrap() {
            assert!(people.contains(&other), "dangling edge {person}:{other}");
            assert!(
                e.store.ignored(&other).unwrap().contains(person),
                "asymmetric edge {person}:{other}"
            );
        }
    }
    for pair in e.store.all_ignored_pairs().unwrap() {
        assert!(people.contains(pair.low()) && people.contains(pair.high()));
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[test]
fn match_assigns_within_threshold_only() {
    let e = engine(4);
    let alice = person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);

    // Distance 0.10 and 0.20 from Alice's only face, on opposite sides so
    // the near face joining Alice moves her centroid away from the far one.
    let ids = e
        .ingest_faces(&[
            face("near", &[0.9, 0.19f32.sqrt(), 0.0, 0.0]),
            face("far", &[0.8, -0.6, 0.0, 0.0]),
        ])
        .unwrap();

    let assigned = e.match_unlabeled_faces(0.15, &NoProgress, &CancelToken::new()).unwrap();
    assert_eq!(assigned, 1);
    assert_eq!(person_of(&e, &ids[0]), Some(alice.clone()));
    assert_eq!(person_of(&e, &ids[1]), None);
    assert!(e.person_photos(&alice).unwrap().contains(&"near".to_string()));

    // Nothing new: a second pass is a no-op.
    assert_eq!(e.match_unlabeled_faces(0.15, &NoProgress, &CancelToken::new()).unwrap(), 0);

    // The leftover face becomes its own placeholder person.
    assert_eq!(e.discover_clusters(0.15, 3, &NoProgress, &CancelToken::new()).unwrap(), 1);
    let owner = person_of(&e, &ids[1]).unwrap();
    let p = e.get_person(&owner).unwrap();
    assert_eq!(p.name, "Person_1");
    assert_eq!(p.avatar_photo_id.as_deref(), Some("far"));
    assert_consistent(&e);
}

#[test]
fn match_follows_centroid_within_one_pass() {
    let e = engine(4);
    let alice = person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);

    // "second" is 0.20 from Alice's seed face but within 0.15 of the
    // centroid once "first" has joined.
    let ids = e
        .ingest_faces(&[
            face("first", &[0.9, 0.19f32.sqrt(), 0.0, 0.0]),
            face("second", &[0.8, 0.6, 0.0, 0.0]),
        ])
        .unwrap();

    assert_eq!(e.match_unlabeled_faces(0.15, &NoProgress, &CancelToken::new()).unwrap(), 2);
    assert_eq!(person_of(&e, &ids[1]), Some(alice));
    assert_eq!(e.match_unlabeled_faces(0.15, &NoProgress, &CancelToken::new()).unwrap(), 0);
    assert_consistent(&e);
}

#[test]
fn match_fills_missing_avatar_once() {
    let e = engine(4);
    let bob = e.create_person("Bob").unwrap();
    let seed = e.ingest_faces(&[face("p0", &[1.0, 0.0, 0.0, 0.0])]).unwrap();
    e.assign_face(&seed[0], &bob.id).unwrap();
    assert_eq!(e.get_person(&bob.id).unwrap().avatar_photo_id.as_deref(), Some("p0"));

    e.ingest_faces(&[face("p1", &[1.0, 0.01, 0.0, 0.0])]).unwrap();
    e.match_unlabeled_faces(0.2, &NoProgress, &CancelToken::new()).unwrap();
    let bob = e.get_person(&bob.id).unwrap();
    assert_eq!(bob.avatar_photo_id.as_deref(), Some("p0"));
    assert_eq!(e.person_photos(&bob.id).unwrap(), vec!["p0", "p1"]);
}

#[test]
fn match_skips_zero_vectors() {
    let e = engine(4);
    person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let ids = e.ingest_faces(&[face("z", &[0.0; 4])]).unwrap();
    assert_eq!(e.match_unlabeled_faces(0.2, &NoProgress, &CancelToken::new()).unwrap(), 0);
    assert_eq!(person_of(&e, &ids[0]), None);
}

#[test]
fn assignment_to_deleted_person_is_stale() {
    let e = engine(4);
    let gone = e.create_person("Gone").unwrap();
    let ids = e.ingest_faces(&[face("p", &[1.0, 0.0, 0.0, 0.0])]).unwrap();
    e.release_person(&gone.id).unwrap();
    let err = e.assign_face(&ids[0], &gone.id).unwrap_err();
    assert!(matches!(err, PeopleError::StaleReference(_)));
    assert_eq!(person_of(&e, &ids[0]), None);
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[test]
fn discovery_finds_two_groups() {
    let e = engine(4);
    let mut inputs = Vec::new();
    for i in 0..6 {
        let t = 0.01 * i as f32;
        inputs.push(face(&format!("a{i}"), &[1.0, t, 0.0, 0.0]));
        inputs.push(face(&format!("b{i}"), &[0.0, 0.0, 1.0, t]));
    }
    e.ingest_faces(&inputs).unwrap();

    let assigned = e.discover_clusters(0.15, 3, &NoProgress, &CancelToken::new()).unwrap();
    assert_eq!(assigned, 12);

    let people = e.list_people(true).unwrap();
    assert_eq!(people.len(), 2);
    for s in &people {
        assert_eq!(s.face_count, 6);
        assert_eq!(s.photo_count, 6);
        assert!(s.placeholder);
        assert!(s.person.cluster_id.is_some());
    }
    let names: BTreeSet<String> = people.into_iter().map(|s| s.person.name).collect();
    assert_eq!(names, BTreeSet::from(["Person_1".to_string(), "Person_2".to_string()]));
    assert_consistent(&e);
}

#[test]
fn discovery_uses_lowest_free_placeholder() {
    let e = engine(4);
    e.create_person("Person_1").unwrap();
    e.create_person("Person_3").unwrap();
    e.ingest_faces(&[
        face("x", &[1.0, 0.0, 0.0, 0.0]),
        face("y", &[0.0, 1.0, 0.0, 0.0]),
    ])
    .unwrap();
    e.discover_clusters(0.1, 2, &NoProgress, &CancelToken::new()).unwrap();

    let names: BTreeSet<String> = e
        .list_people(true)
        .unwrap()
        .into_iter()
        .map(|s| s.person.name)
        .collect();
    let want: BTreeSet<String> = ["Person_1", "Person_2", "Person_3", "Person_4"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, want);
}

#[test]
fn discovery_with_nothing_to_do() {
    let e = engine(4);
    assert_eq!(e.discover_clusters(0.2, 2, &NoProgress, &CancelToken::new()).unwrap(), 0);
}

#[test]
fn discovery_rejects_bad_parameters() {
    let e = engine(4);
    e.ingest_faces(&[face("x", &[1.0, 0.0, 0.0, 0.0])]).unwrap();
    let err = e.discover_clusters(0.0, 2, &NoProgress, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, PeopleError::Clustering(_)));
}

#[test]
fn concurrent_discovery_never_duplicates_names() {
    let kv: Arc<dyn KVStore> = Arc::new(MemoryStore::new());
    let dim = 16;
    let seed = engine_on(kv.clone(), dim);
    let inputs: Vec<FaceInput> = (0..dim).map(|i| face(&format!("p{i}"), &one_hot(dim, i))).collect();
    seed.ingest_faces(&inputs).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let kv = kv.clone();
            thread::spawn(move || {
                engine_on(kv, dim)
                    .discover_clusters(0.1, 2, &NoProgress, &CancelToken::new())
                    .unwrap()
            })
        })
        .collect();
    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, dim);

    let people = seed.list_people(true).unwrap();
    assert_eq!(people.len(), dim);
    let names: BTreeSet<&str> = people.iter().map(|s| s.person.name.as_str()).collect();
    assert_eq!(names.len(), dim);
    assert_consistent(&seed);
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

#[test]
fn suggestions_respect_hidden_and_dismissed() {
    let e = engine(4);
    let p1 = person_with(&e, "P1", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let p2 = person_with(&e, "P2", &[vec![1.0, 0.02, 0.0, 0.0]]);
    let p3 = person_with(&e, "P3", &[vec![1.0, 0.04, 0.0, 0.0]]);
    let hidden = person_with(&e, "H", &[vec![1.0, 0.01, 0.0, 0.0]]);
    person_with(&e, "Far", &[vec![0.0, 0.0, 1.0, 0.0]]);
    e.set_hidden(&hidden, true).unwrap();
    e.dismiss_suggestion(&p2, &p1).unwrap();

    let got = e.suggest_merges(0.2).unwrap();
    let pairs: Vec<(String, String)> = got
        .iter()
        .map(|s| (s.person_a.clone(), s.person_b.clone()))
        .collect();
    let mut want = vec![ordered(&p1, &p3), ordered(&p2, &p3)];
    want.sort();
    let mut sorted = pairs.clone();
    sorted.sort();
    assert_eq!(sorted, want);

    for s in &got {
        assert!(s.person_a < s.person_b);
        assert!(s.distance < 0.2);
        assert!(s.confidence > 99.0);
        assert_ne!(s.person_a, hidden);
        assert_ne!(s.person_b, hidden);
    }
    for w in got.windows(2) {
        assert!(w[0].distance <= w[1].distance);
    }

    e.undismiss(&p1, &p2).unwrap();
    assert_eq!(e.suggest_merges(0.2).unwrap().len(), 3);
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a < b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[test]
fn similar_persons_nearest_first() {
    let e = engine(4);
    let me = person_with(&e, "Me", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let close = person_with(&e, "Close", &[vec![1.0, 0.05, 0.0, 0.0]]);
    let closer = person_with(&e, "Closer", &[vec![1.0, 0.01, 0.0, 0.0]]);
    let ignored = person_with(&e, "Ignored", &[vec![1.0, 0.0, 0.0, 0.0]]);
    person_with(&e, "Far", &[vec![0.0, 1.0, 0.0, 0.0]]);
    e.dismiss_suggestion(&me, &ignored).unwrap();

    let got: Vec<String> = e
        .similar_to(&me, 0.3)
        .unwrap()
        .into_iter()
        .map(|s| s.person_id)
        .collect();
    assert_eq!(got, vec![closer, close]);

    let empty = e.create_person("Nobody").unwrap();
    assert!(e.similar_to(&empty.id, 0.3).unwrap().is_empty());
}

#[test]
fn dismissing_self_is_rejected() {
    let e = engine(4);
    let p = e.create_person("A").unwrap();
    assert!(matches!(
        e.dismiss_suggestion(&p.id, &p.id),
        Err(PeopleError::InvalidArgument(_))
    ));
    assert!(matches!(
        e.dismiss_suggestion(&p.id, "missing"),
        Err(PeopleError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[test]
fn merge_chain() {
    let e = engine(4);
    let a = person_with(&e, "A", &[vec![1.0, 0.0, 0.0, 0.0], vec![1.0, 0.1, 0.0, 0.0]]);
    let b = person_with(&e, "B", &[vec![0.0, 1.0, 0.0, 0.0]]);
    let c = person_with(&e, "C", &[vec![0.0, 0.0, 1.0, 0.0]]);
    let a_faces: BTreeSet<String> = e.person_faces(&a).unwrap().into_iter().map(|f| f.id).collect();

    let out = e.merge(&a, &b).unwrap();
    assert_eq!(out.faces_moved, 2);
    assert_eq!(out.photos_added, 2);

    assert!(matches!(e.merge(&a, &c), Err(PeopleError::StaleReference(_))));

    let out = e.merge(&b, &c).unwrap();
    assert_eq!(out.faces_moved, 3);
    let c_faces: BTreeSet<String> = e.person_faces(&c).unwrap().into_iter().map(|f| f.id).collect();
    assert!(a_faces.is_subset(&c_faces));
    assert_eq!(c_faces.len(), 4);
    assert_eq!(e.person_photos(&c).unwrap().len(), 4);
    assert!(matches!(e.get_person(&b), Err(PeopleError::NotFound(_))));
    assert_consistent(&e);
}

#[test]
fn merge_moves_edges_and_avatar() {
    let e = engine(4);
    let src = person_with(&e, "Person_5", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let dst = e.create_person("Dana").unwrap().id;
    let n1 = e.create_person("N1").unwrap().id;
    let n2 = e.create_person("N2").unwrap().id;
    e.dismiss_suggestion(&src, &n1).unwrap();
    e.dismiss_suggestion(&src, &dst).unwrap();
    e.dismiss_suggestion(&dst, &n2).unwrap();
    let src_avatar = e.get_person(&src).unwrap().avatar_photo_id;
    assert!(src_avatar.is_some());

    e.merge(&src, &dst).unwrap();

    assert_eq!(e.get_person(&dst).unwrap().avatar_photo_id, src_avatar);
    let mut want = vec![n1.clone(), n2.clone()];
    want.sort();
    assert_eq!(e.ignored_merges(&dst).unwrap(), want);
    assert_eq!(e.ignored_merges(&n1).unwrap(), vec![dst.clone()]);
    assert_eq!(e.ignored_merges(&n2).unwrap(), vec![dst.clone()]);
    // The placeholder name is free again.
    assert!(e.store.name_owner("Person_5").unwrap().is_none());
    assert_consistent(&e);
}

#[test]
fn merge_keeps_target_avatar() {
    let e = engine(4);
    let src = person_with(&e, "S", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let dst = person_with(&e, "D", &[vec![0.0, 1.0, 0.0, 0.0]]);
    let before = e.get_person(&dst).unwrap().avatar_photo_id;
    e.merge(&src, &dst).unwrap();
    assert_eq!(e.get_person(&dst).unwrap().avatar_photo_id, before);
}

#[test]
fn self_merge_is_a_noop() {
    let e = engine(4);
    let a = person_with(&e, "A", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let before = e.get_person(&a).unwrap();
    let out = e.merge(&a, &a).unwrap();
    assert_eq!(out.faces_moved, 0);
    assert_eq!(e.get_person(&a).unwrap(), before);
}

#[test]
fn merge_missing_person_writes_nothing() {
    let e = engine(4);
    let a = person_with(&e, "A", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let before = e.get_person(&a).unwrap();
    assert!(matches!(e.merge(&a, "missing"), Err(PeopleError::StaleReference(_))));
    assert!(matches!(e.merge("missing", &a), Err(PeopleError::StaleReference(_))));
    assert_eq!(e.get_person(&a).unwrap(), before);
    assert_eq!(e.person_faces(&a).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[test]
fn pipeline_merges_placeholder_into_named() {
    let e = engine(4);
    let alice = person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let dup = person_with(&e, "Person_9", &[vec![1.0, 0.05, 0.0, 0.0]]);

    let dry = e
        .run_pipeline(
            &PipelineOptions {
                dry_run: true,
                ..Default::default()
            },
            &NoProgress,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(dry.suggestions, 1);
    assert_eq!(dry.planned, vec![(dup.clone(), alice.clone())]);
    assert_eq!(dry.persons_merged, 0);
    assert!(e.get_person(&dup).is_ok());

    let report = e
        .run_pipeline(&PipelineOptions::default(), &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(report.persons_merged, 1);
    assert!(e.get_person(&dup).is_err());
    assert_eq!(e.person_faces(&alice).unwrap().len(), 2);
    assert_consistent(&e);
}

#[test]
fn pipeline_labels_new_faces() {
    let e = engine(4);
    let alice = person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let ids = e
        .ingest_faces(&[
            face("m", &[1.0, 0.02, 0.0, 0.0]),
            face("c1", &[0.0, 0.0, 1.0, 0.0]),
            face("c2", &[0.0, 0.0, 1.0, 0.01]),
        ])
        .unwrap();
    let report = e
        .run_pipeline(&PipelineOptions::default(), &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(report.faces_matched, 1);
    assert_eq!(report.faces_clustered, 2);
    assert_eq!(report.faces_labeled(), 3);
    assert!(!report.cancelled);
    assert_eq!(person_of(&e, &ids[0]), Some(alice));
    assert_eq!(person_of(&e, &ids[1]), person_of(&e, &ids[2]));
    assert_consistent(&e);
}

#[test]
fn pipeline_progress_is_monotonic() {
    let e = engine(4);
    person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let inputs: Vec<FaceInput> = (0..8)
        .map(|i| face(&format!("p{i}"), &[1.0, 0.01 * i as f32, (i % 3) as f32, 0.0]))
        .collect();
    e.ingest_faces(&inputs).unwrap();

    let seen = Mutex::new(Vec::new());
    let sink = |p: u8| seen.lock().unwrap().push(p);
    e.run_pipeline(&PipelineOptions::default(), &sink, &CancelToken::new())
        .unwrap();

    let seen = seen.into_inner().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.iter().all(|&p| p <= 100));
}

#[test]
fn cancelled_pipeline_keeps_report() {
    let e = engine(4);
    person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    e.ingest_faces(&[face("m", &[1.0, 0.0, 0.0, 0.0])]).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = e.match_unlabeled_faces(0.2, &NoProgress, &cancel).unwrap_err();
    assert!(matches!(err, PeopleError::Cancelled { completed: 0 }));

    let report = e
        .run_pipeline(&PipelineOptions::default(), &NoProgress, &cancel)
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.faces_labeled(), 0);
}

// ---------------------------------------------------------------------------
// Storage failures
// ---------------------------------------------------------------------------

/// Fails the first `failures` scans under `target` with a transient error.
struct FlakyStore {
    inner: MemoryStore,
    target: &'static str,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(target: &'static str) -> Self {
        Self {
            inner: MemoryStore::new(),
            target,
            failures: AtomicUsize::new(0),
        }
    }

    fn trip(&self, prefix: &str) -> KVResult<()> {
        if !prefix.starts_with(self.target) {
            return Ok(());
        }
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(KVError::Unavailable("flaky".into()));
        }
        Ok(())
    }
}

impl KVStore for FlakyStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        self.trip(prefix)?;
        self.inner.scan(prefix)
    }

    fn for_each(&self, prefix: &str, visit: &mut dyn FnMut(&str, &[u8]) -> bool) -> KVResult<()> {
        self.trip(prefix)?;
        self.inner.for_each(prefix, visit)
    }

    fn commit(&self, batch: &Batch) -> KVResult<()> {
        self.inner.commit(batch)
    }
}

#[test]
fn transient_scan_failures_are_retried() {
    let flaky = Arc::new(FlakyStore::new("face:"));
    let e = engine_on(flaky.clone(), 4);
    person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    e.ingest_faces(&[face("m", &[1.0, 0.0, 0.0, 0.0])]).unwrap();

    flaky.failures.store(2, Ordering::SeqCst);
    assert_eq!(e.match_unlabeled_faces(0.2, &NoProgress, &CancelToken::new()).unwrap(), 1);

    e.ingest_faces(&[face("n", &[1.0, 0.0, 0.0, 0.0])]).unwrap();
    flaky.failures.store(5, Ordering::SeqCst);
    let err = e.match_unlabeled_faces(0.2, &NoProgress, &CancelToken::new()).unwrap_err();
    assert!(err.is_transient());
}

#[test]
fn transient_failures_in_suggestion_reads_are_retried() {
    let flaky = Arc::new(FlakyStore::new("ign:"));
    let e = engine_on(flaky.clone(), 4);
    let alice = person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let dup = person_with(&e, "Person_9", &[vec![1.0, 0.05, 0.0, 0.0]]);

    flaky.failures.store(2, Ordering::SeqCst);
    assert_eq!(e.suggest_merges(0.2).unwrap().len(), 1);
    flaky.failures.store(2, Ordering::SeqCst);
    assert_eq!(e.similar_to(&alice, 0.2).unwrap().len(), 1);

    flaky.failures.store(2, Ordering::SeqCst);
    let report = e
        .run_pipeline(&PipelineOptions::default(), &NoProgress, &CancelToken::new())
        .unwrap();
    assert_eq!(report.persons_merged, 1);
    assert!(e.get_person(&dup).is_err());
    assert_consistent(&e);
}

#[test]
fn transient_failures_in_person_listing_are_retried() {
    let flaky = Arc::new(FlakyStore::new("person:"));
    let e = engine_on(flaky.clone(), 4);
    person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);

    flaky.failures.store(2, Ordering::SeqCst);
    assert_eq!(e.list_people(false).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrent writers
// ---------------------------------------------------------------------------

type Interloper = Box<dyn FnOnce(&MemoryStore) + Send>;

/// Runs one queued write against the shared data just before the next
/// commit, as another worker would.
struct RacingStore {
    inner: MemoryStore,
    interloper: Mutex<Option<Interloper>>,
}

impl RacingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            interloper: Mutex::new(None),
        }
    }

    fn before_next_commit(&self, f: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.interloper.lock().unwrap() = Some(Box::new(f));
    }

    /// An engine writing straight to the shared data.
    fn other_worker(&self) -> Engine {
        engine_on(Arc::new(self.inner.clone()), 4)
    }
}

impl KVStore for RacingStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan(prefix)
    }

    fn for_each(&self, prefix: &str, visit: &mut dyn FnMut(&str, &[u8]) -> bool) -> KVResult<()> {
        self.inner.for_each(prefix, visit)
    }

    fn commit(&self, batch: &Batch) -> KVResult<()> {
        let interloper = self.interloper.lock().unwrap().take();
        if let Some(f) = interloper {
            f(&self.inner);
        }
        self.inner.commit(batch)
    }
}

#[test]
fn merge_into_concurrently_deleted_target_is_stale() {
    let racing = Arc::new(RacingStore::new());
    let e = engine_on(racing.clone(), 4);
    let a = person_with(&e, "A", &[vec![1.0, 0.0, 0.0, 0.0]]);
    let b = person_with(&e, "B", &[vec![0.0, 1.0, 0.0, 0.0]]);
    let a_faces = e.person_faces(&a).unwrap();

    let victim = person_key(&b);
    racing.before_next_commit(move |kv| {
        let mut batch = Batch::new();
        batch.delete(victim);
        kv.commit(&batch).unwrap();
    });

    assert!(matches!(e.merge(&a, &b), Err(PeopleError::StaleReference(_))));
    assert!(e.get_person(&a).is_ok());
    assert_eq!(e.person_faces(&a).unwrap(), a_faces);
    assert_eq!(person_of(&e, &a_faces[0].id), Some(a));
}

#[test]
fn concurrent_avatar_fill_in_writes_once() {
    let racing = Arc::new(RacingStore::new());
    let e = engine_on(racing.clone(), 4);
    let bob = e.create_person("Bob").unwrap();
    let ids = e
        .ingest_faces(&[
            face("p1", &[1.0, 0.0, 0.0, 0.0]),
            face("p2", &[1.0, 0.01, 0.0, 0.0]),
        ])
        .unwrap();

    let other = racing.other_worker();
    let (face, person) = (ids[1].clone(), bob.id.clone());
    racing.before_next_commit(move |_| {
        assert!(other.assign_face(&face, &person).unwrap());
    });

    // Loses the race on Bob's record, re-reads and keeps the winner's avatar.
    assert!(e.assign_face(&ids[0], &bob.id).unwrap());

    let after = e.get_person(&bob.id).unwrap();
    assert_eq!(after.avatar_photo_id.as_deref(), Some("p2"));
    assert_eq!(after.revision, bob.revision + 2);
    assert_eq!(e.person_photos(&bob.id).unwrap(), vec!["p1", "p2"]);
    assert_eq!(person_of(&e, &ids[0]), Some(bob.id.clone()));
    assert_eq!(person_of(&e, &ids[1]), Some(bob.id.clone()));
    assert_consistent(&e);
}

#[test]
fn racing_placeholder_creation_reports_taken() {
    let racing = Arc::new(RacingStore::new());
    let e = engine_on(racing.clone(), 4);

    let other = racing.other_worker();
    racing.before_next_commit(move |_| {
        other.create_person("Person_3").unwrap();
    });

    let err = e.create_person("Person_3").unwrap_err();
    assert!(matches!(err, PeopleError::InvalidArgument(ref m) if m.contains("taken")), "{err}");
    assert_eq!(e.list_people(true).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("people.redb");
    let (alice, face_id) = {
        let e = engine_on(Arc::new(RedbStore::open(&path).unwrap()), 4);
        let alice = person_with(&e, "Alice", &[vec![1.0, 0.0, 0.0, 0.0]]);
        let ids = e.ingest_faces(&[face("m", &[1.0, 0.01, 0.0, 0.0])]).unwrap();
        e.match_unlabeled_faces(0.2, &NoProgress, &CancelToken::new()).unwrap();
        (alice, ids[0].clone())
    };

    let e = engine_on(Arc::new(RedbStore::open(&path).unwrap()), 4);
    assert_eq!(person_of(&e, &face_id), Some(alice.clone()));
    assert_eq!(e.person_faces(&alice).unwrap().len(), 2);
    assert_consistent(&e);
}
