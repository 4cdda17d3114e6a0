//! KV key layout.
//!
//! ```text
//! face:{face}               -> Face (msgpack)
//! fp:{person}:{face}        -> empty (person -> faces index)
//! ff:{photo}:{face}         -> empty (photo -> faces index)
//! person:{person}           -> Person (msgpack)
//! pp:{person}:{photo}       -> empty (photo associations)
//! ign:{a}:{b}               -> empty (dismissed pair, written both ways)
//! pname:{name}              -> person id (placeholder name reservation)
//! ```
//!
//! Person and face ids are UUIDs and photo ids are validated not to contain
//! ':', so every suffix after a scoped prefix is a single segment.

pub const FACE_PREFIX: &str = "face:";
pub const PERSON_PREFIX: &str = "person:";
pub const PERSON_PHOTO_PREFIX: &str = "pp:";
pub const IGNORE_PREFIX: &str = "ign:";
pub const NAME_PREFIX: &str = "pname:";

pub fn face_key(face: &str) -> String {
    format!("face:{face}")
}

pub fn person_key(person: &str) -> String {
    format!("person:{person}")
}

/// Format: `fp:{person}:{face}`
pub fn person_face_key(person: &str, face: &str) -> String {
    format!("fp:{person}:{face}")
}

/// Format: `fp:{person}:`
pub fn person_faces_prefix(person: &str) -> String {
    format!("fp:{person}:")
}

/// Format: `ff:{photo}:{face}`
pub fn photo_face_key(photo: &str, face: &str) -> String {
    format!("ff:{photo}:{face}")
}

/// Format: `ff:{photo}:`
pub fn photo_faces_prefix(photo: &str) -> String {
    format!("ff:{photo}:")
}

/// Format: `pp:{person}:{photo}`
pub fn person_photo_key(person: &str, photo: &str) -> String {
    format!("pp:{person}:{photo}")
}

/// Format: `pp:{person}:`
pub fn person_photos_prefix(person: &str) -> String {
    format!("pp:{person}:")
}

/// Format: `ign:{a}:{b}`
pub fn ignore_key(a: &str, b: &str) -> String {
    format!("ign:{a}:{b}")
}

/// Format: `ign:{a}:`
pub fn ignore_prefix(a: &str) -> String {
    format!("ign:{a}:")
}

/// Format: `pname:{name}`
pub fn name_key(name: &str) -> String {
    format!("pname:{name}")
}

/// Return the part of `key` after `prefix`, or `None` if it does not start
/// with it.
pub fn suffix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

/// Split `{a}:{b}` as found after a two-segment prefix such as `fp:`.
pub fn split_pair(rest: &str) -> Option<(&str, &str)> {
    rest.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_prefixes_do_not_overlap() {
        let k = person_face_key("p1", "f1");
        assert!(k.starts_with(&person_faces_prefix("p1")));
        assert!(!k.starts_with(&person_faces_prefix("p")));
    }

    #[test]
    fn split_pair_roundtrip() {
        let key = ignore_key("a", "b");
        let rest = suffix(&key, IGNORE_PREFIX).unwrap();
        assert_eq!(split_pair(rest), Some(("a", "b")));
    }
}
