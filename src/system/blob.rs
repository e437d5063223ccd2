//! Process-wide device and credential values.

use std::collections::BTreeMap;
use std::fmt;

use zeroize::{Zeroize, Zeroizing};

/// Well-known blob slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlobKey {
    /// Device serial number.
    DeviceSerial,
    /// Device firmware version.
    DeviceFirmwareVersion,
    /// Device type / model.
    DeviceType,
    /// Long-lived root credential.
    AuthRootToken,
    /// Short-lived access credential.
    AuthAccessToken,
}

impl BlobKey {
    /// Whether the blob holds credential material.
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::AuthRootToken | Self::AuthAccessToken)
    }
}

/// Keyed byte blobs, zeroized when cleared or dropped.
///
/// A blob is either set in one piece or built up by appending fragments;
/// reads return the fragments concatenated in order.
#[derive(Default)]
pub struct BlobStore {
    blobs: BTreeMap<BlobKey, Vec<Vec<u8>>>,
}

impl BlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the blob with `value`.
    pub fn set(&mut self, key: BlobKey, value: impl Into<Vec<u8>>) {
        self.clear(key);
        self.blobs.insert(key, vec![value.into()]);
    }

    /// Append a fragment to the blob.
    pub fn append(&mut self, key: BlobKey, fragment: &[u8]) {
        self.blobs.entry(key).or_default().push(fragment.to_vec());
    }

    /// Remove and zeroize the blob.
    pub fn clear(&mut self, key: BlobKey) {
        if let Some(mut fragments) = self.blobs.remove(&key) {
            for fragment in &mut fragments {
                fragment.zeroize();
            }
        }
    }

    /// Total size of the blob in bytes.
    pub fn size(&self, key: BlobKey) -> usize {
        self.blobs
            .get(&key)
            .map(|fragments| fragments.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Whether the blob holds any bytes.
    pub fn contains(&self, key: BlobKey) -> bool {
        self.size(key) > 0
    }

    /// The blob contents, concatenated.
    pub fn get(&self, key: BlobKey) -> Option<Zeroizing<Vec<u8>>> {
        let fragments = self.blobs.get(&key)?;
        let mut value = Zeroizing::new(Vec::with_capacity(self.size(key)));
        for fragment in fragments {
            value.extend_from_slice(fragment);
        }
        Some(value)
    }
}

impl Drop for BlobStore {
    fn drop(&mut self) {
        for fragments in self.blobs.values_mut() {
            for fragment in fragments.iter_mut() {
                fragment.zeroize();
            }
        }
    }
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: BTreeMap<_, _> = self.blobs.keys().map(|key| (*key, self.size(*key))).collect();
        f.debug_struct("BlobStore").field("sizes", &sizes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces() {
        let mut store = BlobStore::new();
        store.set(BlobKey::DeviceSerial, b"first".to_vec());
        store.set(BlobKey::DeviceSerial, b"second".to_vec());
        assert_eq!(store.get(BlobKey::DeviceSerial).unwrap().as_slice(), b"second");
    }

    #[test]
    fn test_append_concatenates() {
        let mut store = BlobStore::new();
        store.append(BlobKey::AuthRootToken, b"abc");
        store.append(BlobKey::AuthRootToken, b"def");
        assert_eq!(store.size(BlobKey::AuthRootToken), 6);
        assert_eq!(store.get(BlobKey::AuthRootToken).unwrap().as_slice(), b"abcdef");
    }

    #[test]
    fn test_clear_and_missing() {
        let mut store = BlobStore::new();
        store.set(BlobKey::AuthAccessToken, b"token".to_vec());
        store.clear(BlobKey::AuthAccessToken);
        assert!(!store.contains(BlobKey::AuthAccessToken));
        assert!(store.get(BlobKey::AuthAccessToken).is_none());
        assert_eq!(store.size(BlobKey::DeviceType), 0);
    }

    #[test]
    fn test_debug_hides_contents() {
        let mut store = BlobStore::new();
        store.set(BlobKey::AuthRootToken, b"secret".to_vec());
        let debug = format!("{store:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("AuthRootToken"));
        assert!(BlobKey::AuthRootToken.is_secret());
    }
}
