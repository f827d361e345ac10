use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Named code variant held by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Single,
    Cluster,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Single => "single",
            Variant::Cluster => "cluster",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code variants currently held for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub single: Option<String>,
    pub cluster: Option<String>,
}

impl Session {
    pub fn variant(&self, variant: Variant) -> Option<&str> {
        match variant {
            Variant::Single => self.single.as_deref(),
            Variant::Cluster => self.cluster.as_deref(),
        }
    }
}

/// Process-wide session map shared by request handlers.
///
/// Cloning yields another handle to the same map. Every mutation is a
/// single insert under one lock, so readers never observe a session with
/// only part of an update applied.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    inner: Arc<Mutex<HashMap<String, Session>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        match self.inner.lock() {
            Ok(g) => g,
            // Mutations never leave the map half-written; keep serving.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace one variant of a session, creating the session if needed.
    pub fn put(&self, session: &str, variant: Variant, code: impl Into<String>) {
        let code = code.into();
        let mut map = self.lock();
        let mut next = map.get(session).cloned().unwrap_or_default();
        match variant {
            Variant::Single => next.single = Some(code),
            Variant::Cluster => next.cluster = Some(code),
        }
        map.insert(session.to_string(), next);
    }

    /// Replace both variants in one step.
    pub fn put_pair(&self, session: &str, single: impl Into<String>, cluster: impl Into<String>) {
        let next = Session {
            single: Some(single.into()),
            cluster: Some(cluster.into()),
        };
        self.lock().insert(session.to_string(), next);
    }

    pub fn get(&self, session: &str) -> Option<Session> {
        self.lock().get(session).cloned()
    }

    pub fn get_variant(&self, session: &str, variant: Variant) -> Option<String> {
        self.lock()
            .get(session)
            .and_then(|s| s.variant(variant).map(str::to_string))
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_on_unknown_session_is_none() {
        let store = ArtifactStore::new();
        assert!(store.get("nope").is_none());
        assert!(store.get_variant("nope", Variant::Cluster).is_none());
    }

    #[test]
    fn put_replaces_only_the_named_variant() {
        let store = ArtifactStore::new();
        store.put_pair("s", "one", "two");
        store.put("s", Variant::Cluster, "three");

        let session = store.get("s").unwrap();
        assert_eq!(session.single.as_deref(), Some("one"));
        assert_eq!(session.cluster.as_deref(), Some("three"));
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let store = ArtifactStore::new();
        let code = "print('x')\r\n\ttabs and unicode: \u{0e01}\n\n";
        store.put("s", Variant::Single, code);
        assert_eq!(store.get_variant("s", Variant::Single).as_deref(), Some(code));
    }

    #[test]
    fn concurrent_writers_to_distinct_sessions_all_land() {
        let store = ArtifactStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for j in 0..50 {
                        store.put(&format!("s{i}"), Variant::Cluster, format!("code-{j}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.sessions().len(), 8);
        for i in 0..8 {
            assert_eq!(
                store.get_variant(&format!("s{i}"), Variant::Cluster).as_deref(),
                Some("code-49")
            );
        }
    }

    #[test]
    fn readers_never_see_half_of_a_pair() {
        let store = ArtifactStore::new();
        store.put_pair("s", "single-0", "cluster-0");

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 1..200 {
                    store.put_pair("s", format!("single-{i}"), format!("cluster-{i}"));
                }
            })
        };

        for _ in 0..200 {
            let s = store.get("s").unwrap();
            let a = s.single.unwrap();
            let b = s.cluster.unwrap();
            assert_eq!(
                a.trim_start_matches("single-"),
                b.trim_start_matches("cluster-")
            );
        }
        writer.join().unwrap();
    }
}
