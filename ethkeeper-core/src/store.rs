//! Host storage capability and the in-memory implementation used in tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{CustodyError, CustodyResult};

/// Narrow key-value persistence capability supplied by the host.
///
/// The custody subsystem treats this interface as the sole source of
/// persistent truth for account records and stays agnostic to the backing
/// implementation, which keeps it unit-testable against [`MemoryStore`].
pub trait KvStore: Send + Sync {
    /// Reads the bytes stored at `path`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend read fails. An absent value is
    /// `Ok(None)`, not an error.
    fn get(&self, path: &str) -> CustodyResult<Option<Vec<u8>>>;

    /// Stores `bytes` at `path`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend write fails.
    fn put(&self, path: &str, bytes: Vec<u8>) -> CustodyResult<()>;

    /// Removes the value at `path`. Removing an absent value is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend delete fails.
    fn delete(&self, path: &str) -> CustodyResult<()>;
}

impl<S: KvStore + ?Sized> KvStore for Arc<S> {
    fn get(&self, path: &str) -> CustodyResult<Option<Vec<u8>>> {
        (**self).get(path)
    }

    fn put(&self, path: &str, bytes: Vec<u8>) -> CustodyResult<()> {
        (**self).put(path, bytes)
    }

    fn delete(&self, path: &str) -> CustodyResult<()> {
        (**self).delete(path)
    }
}

/// In-memory [`KvStore`] backed by a `HashMap`.
///
/// Thread-safe. Intended for tests and for embedding without a host store;
/// nothing it holds survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("store lock poisoned").len()
    }

    /// Whether the store holds no entries.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("store lock poisoned").is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, path: &str) -> CustodyResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| CustodyError::storage("get", "store lock poisoned"))?
            .get(path)
            .cloned())
    }

    fn put(&self, path: &str, bytes: Vec<u8>) -> CustodyResult<()> {
        self.entries
            .write()
            .map_err(|_| CustodyError::storage("put", "store lock poisoned"))?
            .insert(path.to_owned(), bytes);
        Ok(())
    }

    fn delete(&self, path: &str) -> CustodyResult<()> {
        self.entries
            .write()
            .map_err(|_| CustodyError::storage("delete", "store lock poisoned"))?
            .remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("accounts/a").unwrap(), None);

        store.put("accounts/a", b"record".to_vec()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("accounts/a").unwrap(), Some(b"record".to_vec()));

        store.put("accounts/a", b"replaced".to_vec()).unwrap();
        assert_eq!(store.get("accounts/a").unwrap(), Some(b"replaced".to_vec()));

        store.delete("accounts/a").unwrap();
        assert_eq!(store.get("accounts/a").unwrap(), None);

        // Deleting again stays a no-op.
        store.delete("accounts/a").unwrap();
    }

    #[test]
    fn concurrent_writers_land_independently() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let path = format!("accounts/{i}");
                store.put(&path, format!("record-{i}").into_bytes()).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
