// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Injected key/value persistence, mirroring `settingsservice::settings_storage`:
//! a thin `etcd-client` wrapper behind a `Storage` trait so higher layers can be
//! tested against an in-memory fake instead of a live etcd cluster.
//!
//! Absence of the persistence handle is a fatal error for write/load (returned
//! to the caller), never a panic (§6.4).

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Key/value persistence interface used by the per-node and shared state buckets.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// List all `(key, value)` pairs whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError>;
}

/// `etcd-client`-backed implementation, the production persistence backend.
pub struct EtcdStorage {
    client: tokio::sync::Mutex<etcd_client::Client>,
}

impl EtcdStorage {
    pub async fn connect(endpoints: &[String]) -> Result<Self, StorageError> {
        let client = etcd_client::Client::connect(endpoints, None)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            client: tokio::sync::Mutex::new(client),
        })
    }
}

#[async_trait]
impl Storage for EtcdStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(
                kv.value_str()
                    .map_err(|e| StorageError::Serialization(e.to_string()))?
                    .to_owned(),
            )),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        client
            .put(key, value, None)
            .await
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut client = self.client.lock().await;
        client
            .delete(key, None)
            .await
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        let mut client = self.client.lock().await;
        let opts = Some(etcd_client::GetOptions::new().with_prefix());
        let resp = client
            .get(prefix, opts)
            .await
            .map_err(|e| StorageError::OperationFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let k = kv
                .key_str()
                .map_err(|e| StorageError::Serialization(e.to_string()))?
                .to_string();
            let v = kv
                .value_str()
                .map_err(|e| StorageError::Serialization(e.to_string()))?
                .to_string();
            out.push((k, v));
        }
        Ok(out)
    }
}

/// In-memory fake used by unit tests for every component layered on [`Storage`].
#[derive(Default)]
pub struct InMemoryStorage {
    data: Mutex<BTreeMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_put_get_delete_roundtrip() {
        let store = InMemoryStorage::new();
        store.put("state/node-a/i-1", "{}").await.unwrap();
        assert_eq!(
            store.get("state/node-a/i-1").await.unwrap(),
            Some("{}".to_string())
        );
        store.delete("state/node-a/i-1").await.unwrap();
        assert_eq!(store.get("state/node-a/i-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn in_memory_list_respects_prefix() {
        let store = InMemoryStorage::new();
        store.put("state/node-a/i-1", "a").await.unwrap();
        store.put("state/node-a/i-2", "b").await.unwrap();
        store.put("state/stopped/i-3", "c").await.unwrap();

        let listed = store.list("state/node-a/").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
