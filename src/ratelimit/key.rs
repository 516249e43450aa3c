//! Storage key derivation.

use std::fmt;
use std::sync::Arc;

/// Maps a caller identifier to the key its window is stored under.
///
/// The default is the identity. A custom generator lets several identifiers
/// share one budget (for example, every key belonging to one tenant).
#[derive(Clone)]
pub struct KeyGenerator {
    derive: Arc<dyn Fn(&str) -> String + Send + Sync>,
}

impl KeyGenerator {
    /// Create a key generator from a function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self { derive: Arc::new(f) }
    }

    /// Use the identifier itself as the key.
    pub fn identity() -> Self {
        Self::new(|identifier| identifier.to_string())
    }

    /// Namespace every key under `prefix`.
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self::new(move |identifier| format!("{}:{}", prefix, identifier))
    }

    /// Derive the storage key for an identifier.
    pub fn derive(&self, identifier: &str) -> String {
        (self.derive)(identifier)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator").finish_non_exhaustive()
    }
}
