/// Order-independent identity of a factor combination.
///
/// A key is the ascending, lexically sorted list of its parts joined with
/// [`KEY_SEPARATOR`]. Parts are factor ids (test mode), factor names
/// (simulation) or a single model id (live mode). The separator is rejected
/// in factor names at the catalog boundary and never occurs in generated ids,
/// so splitting a key always recovers its parts.

pub const KEY_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ModelKey(String);

impl ModelKey {
    /// Wrap an already-derived key, e.g. one read back from a persisted record.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parts of the key in sorted order. A single-part key yields itself.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR).filter(|p| !p.is_empty())
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the key for a combination. Pure and total.
pub fn derive_key<S: AsRef<str>>(parts: &[S]) -> ModelKey {
    let mut sorted: Vec<&str> = parts.iter().map(|p| p.as_ref()).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut key = String::with_capacity(sorted.iter().map(|p| p.len() + 1).sum());
    for (i, part) in sorted.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    ModelKey(key)
}

/// True if `s` can be used as a key part without breaking splitting.
#[inline]
pub fn is_valid_part(s: &str) -> bool {
    !s.is_empty() && !s.contains(KEY_SEPARATOR)
}
