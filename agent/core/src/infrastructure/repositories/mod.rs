// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the store abstractions defined in the
//! domain layer.
//!
//! # Available Implementations
//!
//! - **InMemoryAttachmentStore** - Thread-safe map of live attachments. The
//!   engine's pending set is rebuilt from re-delivered proposals on restart,
//!   so nothing here needs to be durable.

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::RwLock;
use crate::domain::attachment::{AttachmentRecord, ResourceKey};
use crate::domain::repository::{AttachmentStore, RepositoryError};

#[derive(Clone, Default)]
pub struct InMemoryAttachmentStore {
    attachments: Arc<RwLock<BTreeMap<ResourceKey, AttachmentRecord>>>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.attachments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.read().is_empty()
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn add(&self, record: AttachmentRecord) -> Result<(), RepositoryError> {
        let mut attachments = self.attachments.write();
        if attachments.contains_key(&record.resource_key) {
            return Err(RepositoryError::AlreadyExists(record.resource_key.to_string()));
        }
        attachments.insert(record.resource_key.clone(), record);
        Ok(())
    }

    async fn update(&self, record: AttachmentRecord) -> Result<(), RepositoryError> {
        let mut attachments = self.attachments.write();
        match attachments.get_mut(&record.resource_key) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(RepositoryError::NotFound(record.resource_key.to_string())),
        }
    }

    async fn remove(&self, key: &ResourceKey) -> Result<Option<AttachmentRecord>, RepositoryError> {
        Ok(self.attachments.write().remove(key))
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<AttachmentRecord>, RepositoryError> {
        Ok(self.attachments.read().get(key).cloned())
    }

    async fn all_pending(&self) -> Result<Vec<AttachmentRecord>, RepositoryError> {
        Ok(self.attachments.read().values().cloned().collect())
    }
}
