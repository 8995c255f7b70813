// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Object store and key-pair client (§4.3, added): serves validation steps
//! (1) and (2) of `RunInstances`. The real object store is out of scope;
//! only the seam and an in-memory test double live here.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct KeyPairMeta {
    pub name: String,
    pub fingerprint: String,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn ami_exists(&self, image_id: &str) -> bool;
    async fn resolve_key_pair(&self, name: &str) -> Option<KeyPairMeta>;
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    amis: Mutex<HashSet<String>>,
    key_pairs: Mutex<HashMap<String, KeyPairMeta>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_ami(&self, image_id: &str) {
        self.amis.lock().await.insert(image_id.to_string());
    }

    pub async fn seed_key_pair(&self, meta: KeyPairMeta) {
        self.key_pairs.lock().await.insert(meta.name.clone(), meta);
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn ami_exists(&self, image_id: &str) -> bool {
        self.amis.lock().await.contains(image_id)
    }

    async fn resolve_key_pair(&self, name: &str) -> Option<KeyPairMeta> {
        self.key_pairs.lock().await.get(name).cloned()
    }
}
