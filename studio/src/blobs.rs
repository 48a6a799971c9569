use std::collections::HashMap;
use std::sync::Mutex;

use base64::Engine;
use serde::{Deserialize, Serialize};

const BLOB_SCHEME: &str = "blob:";

/// Opaque reference to locally-held image bytes, rendered as a `blob:` URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(String);

impl BlobHandle {
    /// Recognize a `blob:` URL. Remote and data URLs return `None`.
    pub fn from_url(url: &str) -> Option<Self> {
        url.starts_with(BLOB_SCHEME).then(|| Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct BlobEntry {
    bytes: Vec<u8>,
    mime: String,
}

/// Registry of transient image handles.
///
/// Each handle has exactly one owner (a composer run or a slide) and is
/// released exactly once. Releasing an unknown or already-released handle is
/// a no-op that returns `false`.
#[derive(Default)]
pub struct BlobRegistry {
    entries: Mutex<HashMap<BlobHandle, BlobEntry>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bytes: Vec<u8>, mime: &str) -> BlobHandle {
        let handle = BlobHandle(format!("{BLOB_SCHEME}{}", uuid::Uuid::new_v4()));
        self.entries.lock().unwrap().insert(
            handle.clone(),
            BlobEntry {
                bytes,
                mime: mime.to_string(),
            },
        );
        handle
    }

    pub fn contains(&self, handle: &BlobHandle) -> bool {
        self.entries.lock().unwrap().contains_key(handle)
    }

    /// Copy a live blob under a fresh handle with its own owner.
    pub fn duplicate(&self, handle: &BlobHandle) -> Option<BlobHandle> {
        let (bytes, mime) = {
            let entries = self.entries.lock().unwrap();
            let entry = entries.get(handle)?;
            (entry.bytes.clone(), entry.mime.clone())
        };
        Some(self.register(bytes, &mime))
    }

    /// `data:<mime>;base64,...` encoding, suitable for a JSON request body.
    pub fn data_url(&self, handle: &BlobHandle) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(handle)?;
        Some(format!(
            "data:{};base64,{}",
            entry.mime,
            base64::engine::general_purpose::STANDARD.encode(&entry.bytes)
        ))
    }

    pub fn release(&self, handle: &BlobHandle) -> bool {
        let released = self.entries.lock().unwrap().remove(handle).is_some();
        if !released {
            tracing::debug!("blob {handle} already released");
        }
        released
    }

    /// Release every handle in `handles`, returning how many were live.
    pub fn release_all<'a>(&self, handles: impl IntoIterator<Item = &'a BlobHandle>) -> usize {
        handles.into_iter().filter(|h| self.release(h)).count()
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Prefix raw base64 with a data-URL header unless it already carries one.
pub fn ensure_data_url(base64: &str, mime: &str) -> String {
    if base64.starts_with("data:") {
        base64.to_string()
    } else {
        format!("data:{mime};base64,{base64}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_encode() {
        let blobs = BlobRegistry::new();
        let h = blobs.register(vec![1, 2, 3], "image/png");
        assert!(h.as_str().starts_with("blob:"));
        assert_eq!(blobs.data_url(&h).as_deref(), Some("data:image/png;base64,AQID"));
    }

    #[test]
    fn duplicate_is_independent() {
        let blobs = BlobRegistry::new();
        let h = blobs.register(vec![1, 2, 3], "image/webp");
        let copy = blobs.duplicate(&h).unwrap();
        assert_ne!(copy, h);
        assert!(blobs.release(&h));
        assert_eq!(blobs.data_url(&copy).as_deref(), Some("data:image/webp;base64,AQID"));
        assert!(blobs.duplicate(&h).is_none());
    }

    #[test]
    fn release_happens_once() {
        let blobs = BlobRegistry::new();
        let h = blobs.register(vec![0], "image/png");
        assert!(blobs.release(&h));
        assert!(!blobs.release(&h));
        assert_eq!(blobs.live_count(), 0);
        assert!(blobs.data_url(&h).is_none());
    }

    #[test]
    fn from_url_only_accepts_blob_scheme() {
        assert!(BlobHandle::from_url("blob:abc").is_some());
        assert!(BlobHandle::from_url("https://cdn/x.png").is_none());
        assert!(BlobHandle::from_url("data:image/png;base64,AA").is_none());
    }

    #[test]
    fn data_url_prefix() {
        assert_eq!(ensure_data_url("AQID", "image/png"), "data:image/png;base64,AQID");
        assert_eq!(ensure_data_url("data:image/gif;base64,AA", "image/png"), "data:image/gif;base64,AA");
    }
}
