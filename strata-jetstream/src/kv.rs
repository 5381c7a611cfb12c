//! Key-value buckets: last value wins per key, revisions from a bucket-wide
//! counter.

use crate::config::validate_name;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strata_core::{subject::validate_subject, Error, Result, Timestamp};

/// A stored value with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Value bytes, possibly empty
    pub value: Bytes,
    /// Revision assigned by the put that wrote it
    pub revision: u64,
    /// Time of that put
    pub created: Timestamp,
}

/// Summary of a bucket for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStatus {
    /// Bucket name
    pub bucket: String,
    /// Live keys
    pub values: u64,
    /// Last revision handed out
    pub revision: u64,
    /// Creation time
    pub created: Timestamp,
}

#[derive(Debug, Default)]
struct KvInner {
    entries: BTreeMap<String, KvEntry>,
    revision: u64,
}

/// A named key-value bucket.
#[derive(Debug)]
pub struct KvBucket {
    name: String,
    created: Timestamp,
    inner: Mutex<KvInner>,
}

/// Keys follow subject token rules and may span several tokens.
///
/// # Errors
/// [`Error::InvalidRequest`] for empty keys, wildcards or whitespace.
pub fn validate_key(key: &str) -> Result<()> {
    validate_subject(key).map_err(|_| Error::invalid_request(format!("invalid key '{key}'")))
}

impl KvBucket {
    /// Create an empty bucket.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for an invalid bucket name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name("bucket", &name)?;
        Ok(Self { name, created: chrono::Utc::now(), inner: Mutex::new(KvInner::default()) })
    }

    /// Bucket name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `value` under `key` and return the new revision.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for an invalid key.
    pub fn put(&self, key: &str, value: impl Into<Bytes>) -> Result<u64> {
        validate_key(key)?;
        let mut inner = self.inner.lock();
        inner.revision += 1;
        let revision = inner.revision;
        inner.entries.insert(
            key.to_string(),
            KvEntry { value: value.into(), revision, created: chrono::Utc::now() },
        );
        Ok(revision)
    }

    /// Current value of `key`.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the key is absent.
    pub fn get(&self, key: &str) -> Result<Bytes> {
        self.entry(key).map(|e| e.value)
    }

    /// Current value and revision of `key`.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the key is absent.
    pub fn entry(&self, key: &str) -> Result<KvEntry> {
        self.inner
            .lock()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found("key", key))
    }

    /// Remove `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for an invalid key.
    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.inner.lock().entries.remove(key);
        Ok(())
    }

    /// Remove `key` and its history. Without history this equals
    /// [`KvBucket::delete`].
    ///
    /// # Errors
    /// [`Error::InvalidRequest`] for an invalid key.
    pub fn purge(&self, key: &str) -> Result<()> {
        self.delete(key)
    }

    /// Live keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Key count and revision counter.
    #[must_use]
    pub fn status(&self) -> KvStatus {
        let inner = self.inner.lock();
        KvStatus {
            bucket: self.name.clone(),
            values: inner.entries.len() as u64,
            revision: inner.revision,
            created: self.created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get_delete() {
        let bucket = KvBucket::new("config").unwrap();
        assert_eq!(bucket.put("k", "v1").unwrap(), 1);
        assert_eq!(bucket.put("k", "v2").unwrap(), 2);
        assert_eq!(bucket.get("k").unwrap(), "v2");
        assert_eq!(bucket.entry("k").unwrap().revision, 2);

        bucket.delete("k").unwrap();
        assert!(matches!(bucket.get("k"), Err(Error::NotFound { .. })));
        bucket.delete("k").unwrap();
    }

    #[test]
    fn test_empty_value_is_not_absent() {
        let bucket = KvBucket::new("b").unwrap();
        bucket.put("empty", Bytes::new()).unwrap();
        assert!(bucket.get("empty").unwrap().is_empty());
        assert!(bucket.get("never").is_err());
    }

    #[test]
    fn test_revisions_are_bucket_wide() {
        let bucket = KvBucket::new("b").unwrap();
        assert_eq!(bucket.put("a", "1").unwrap(), 1);
        assert_eq!(bucket.put("b", "1").unwrap(), 2);
        assert_eq!(bucket.put("a", "2").unwrap(), 3);
        bucket.purge("b").unwrap();
        assert_eq!(bucket.keys(), vec!["a".to_string()]);
        assert_eq!(bucket.status().revision, 3);
    }

    #[test]
    fn test_invalid_names_and_keys() {
        assert!(KvBucket::new("a.b").is_err());
        let bucket = KvBucket::new("b").unwrap();
        assert!(bucket.put("", "x").is_err());
        assert!(bucket.put("a.*", "x").is_err());
        assert!(bucket.put("nested.key", "x").is_ok());
    }

    #[test]
    fn test_concurrent_puts_serialize() {
        let bucket = Arc::new(KvBucket::new("b").unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || {
                    (0..100).map(|i| bucket.put("k", format!("{i}")).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut revisions: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        revisions.sort_unstable();
        revisions.dedup();
        assert_eq!(revisions.len(), 400);
        assert_eq!(bucket.entry("k").unwrap().revision, 400);
    }
}
