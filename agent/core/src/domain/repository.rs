// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Attachment Store Contract
//!
//! The table of live attachments, keyed by `ResourceKey`. Readers outside the
//! reconciliation engine (status reporting, introspection) may query it at any
//! time; writes are funneled through the engine's mailbox.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `AttachmentStore` | `AttachmentRecord` | `InMemoryAttachmentStore` |

use async_trait::async_trait;
use crate::domain::attachment::{AttachmentRecord, ResourceKey};

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Insert a new record; fails if the key is already live
    async fn add(&self, record: AttachmentRecord) -> Result<(), RepositoryError>;

    /// Replace an existing record (status changes)
    async fn update(&self, record: AttachmentRecord) -> Result<(), RepositoryError>;

    /// Remove a record, returning it if it was present
    async fn remove(&self, key: &ResourceKey) -> Result<Option<AttachmentRecord>, RepositoryError>;

    /// Find a record by key
    async fn get(&self, key: &ResourceKey) -> Result<Option<AttachmentRecord>, RepositoryError>;

    /// Snapshot of every live record, ordered by key
    async fn all_pending(&self) -> Result<Vec<AttachmentRecord>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),
}

