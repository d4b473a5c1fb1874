// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::domain::attachment::{AttachmentId, IdentityMismatch, ResourceKey};

/// Why an attachment failed to reconcile
///
/// Consumers must keep these apart: a mismatch means a different resource
/// occupies the device slot, which is a data-integrity concern, not a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AttachmentFailureReason {
    /// Deadline reached without discovery confirming the attachment
    Expired,
    /// Discovery found a different identity at the declared location
    Mismatch { mismatch: IdentityMismatch },
}

impl AttachmentFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Mismatch { .. } => "mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentEvent {
    AttachmentConfirmed {
        attachment_id: AttachmentId,
        resource_key: ResourceKey,
        task_ref: Option<String>,
        confirmed_at: DateTime<Utc>,
    },
    AttachmentFailed {
        attachment_id: AttachmentId,
        resource_key: ResourceKey,
        task_ref: Option<String>,
        reason: AttachmentFailureReason,
        failed_at: DateTime<Utc>,
    },
}

impl AttachmentEvent {
    pub fn resource_key(&self) -> &ResourceKey {
        match self {
            Self::AttachmentConfirmed { resource_key, .. } => resource_key,
            Self::AttachmentFailed { resource_key, .. } => resource_key,
        }
    }

    pub fn task_ref(&self) -> Option<&str> {
        match self {
            Self::AttachmentConfirmed { task_ref, .. } => task_ref.as_deref(),
            Self::AttachmentFailed { task_ref, .. } => task_ref.as_deref(),
        }
    }

    /// "attached", "expired" or "mismatch"
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::AttachmentConfirmed { .. } => "attached",
            Self::AttachmentFailed { reason, .. } => reason.as_str(),
        }
    }
}
