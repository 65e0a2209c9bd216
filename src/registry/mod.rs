//! The shared key-value registry.
//!
//! The registry is the one store which every agent can reach independently of the exchange's
//! notification transport. It backs the admission barrier, the writer leases and the exchange
//! store itself.

mod etcd;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

pub use etcd::EtcdRegistry;

/// A string-keyed, string-valued registry.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Unconditionally write the given value.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Read the value of the given key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read all keys beginning with the given prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// Write `new` only if the current value equals `expected`, where `None` means absent.
    ///
    /// Returns `true` if the write was applied.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool>;

    /// Write `value` to `key` only if `guard_key` currently holds `guard_value`, atomically.
    ///
    /// Returns `true` if the write was applied.
    async fn put_guarded(&self, key: &str, value: &str, guard_key: &str, guard_value: &str) -> Result<bool>;

    /// Delete the given key, which is not an error if absent.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// A process-local registry.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    data: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.data.lock().await.insert(key.into(), value.into());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let data = self.data.lock().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, val)| (key.clone(), val.clone()))
            .collect())
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        if data.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        data.insert(key.into(), new.into());
        Ok(true)
    }

    async fn put_guarded(&self, key: &str, value: &str, guard_key: &str, guard_value: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        if data.get(guard_key).map(String::as_str) != Some(guard_value) {
            return Ok(false);
        }
        data.insert(key.into(), value.into());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().await.remove(key);
        Ok(())
    }
}
