// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Value Objects
// ============================================================================

/// Well-known property names carried by block-volume proposals
pub mod properties {
    pub const VOLUME_ID: &str = "volumeId";
    pub const DEVICE_NAME: &str = "deviceName";
    pub const VOLUME_SIZE_GIB: &str = "volumeSizeGib";
    pub const SOURCE_VOLUME_HOST_PATH: &str = "sourceVolumeHostPath";
    pub const VOLUME_NAME: &str = "volumeName";
    pub const FILE_SYSTEM: &str = "fileSystem";
}

/// Resource kinds this agent build knows how to reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Block-storage volume attached to the host as a device node
    ElasticBlockStorage,
}

impl ResourceKind {
    /// Short tag used as the resource key prefix
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ElasticBlockStorage => "ebs",
        }
    }

    /// Properties a proposal of this kind must carry (non-empty)
    pub fn required_properties(&self) -> &'static [&'static str] {
        match self {
            Self::ElasticBlockStorage => &[properties::VOLUME_ID, properties::DEVICE_NAME],
        }
    }

    /// Property holding the identity the control plane declared
    pub fn identity_property(&self) -> &'static str {
        match self {
            Self::ElasticBlockStorage => properties::VOLUME_ID,
        }
    }

    /// Property telling discovery where on the host to look
    pub fn locator_property(&self) -> &'static str {
        match self {
            Self::ElasticBlockStorage => properties::DEVICE_NAME,
        }
    }
}

impl FromStr for ResourceKind {
    type Err = AttachmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ebs" | "EBSTaskAttach" | "AmazonElasticBlockStorage" => Ok(Self::ElasticBlockStorage),
            other => Err(AttachmentError::UnrecognizedKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identifier used to acknowledge or remove an attachment
///
/// Derived from the last `/`-separated segment of the opaque attachment
/// reference (e.g. `arn:...:attachment/6f1c` becomes `6f1c`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(String);

impl AttachmentId {
    pub fn from_reference(reference: &str) -> Result<Self, AttachmentError> {
        let segment = reference.trim().rsplit('/').next().unwrap_or_default().trim();
        if segment.is_empty() {
            return Err(AttachmentError::InvalidReference(reference.to_string()));
        }
        Ok(Self(segment.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable key an attachment is stored under: `<kind>:<identity>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(kind: ResourceKind, identity: &str) -> Self {
        Self(format!("{}:{}", kind.tag(), identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attachment announced by the control plane, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentProposal {
    /// Opaque attachment reference (ARN-like)
    pub attachment_ref: String,

    /// Resource kind tag (e.g. "ebs")
    pub kind: String,

    /// Task that declared this attachment, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,

    /// Kind-specific attributes
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Hard deadline after which the proposal is void
    pub expires_at: DateTime<Utc>,
}

/// Discovery found a different resource than the one declared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("expected '{expected}' at {locator}, found '{found}'")]
pub struct IdentityMismatch {
    pub expected: String,
    pub found: String,
    pub locator: String,
}

/// Reconciliation outcome of an attachment
///
/// `Errored` is sticky: once a mismatch is recorded the attachment only leaves
/// the store through expiry or explicit removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum AttachmentStatus {
    Pending,
    Attached,
    Errored { cause: IdentityMismatch },
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Attached => "attached",
            Self::Errored { .. } => "errored",
        }
    }
}

// ============================================================================
// Aggregate Root: AttachmentRecord
// ============================================================================

/// A validated attachment awaiting host confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub attachment_id: AttachmentId,
    pub resource_key: ResourceKey,
    pub kind: ResourceKind,
    pub task_ref: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub accepted_at: DateTime<Utc>,
    properties: BTreeMap<String, String>,
    status: AttachmentStatus,
}

impl AttachmentRecord {
    /// Validate a proposal against the clock and build the record
    pub fn from_proposal(
        proposal: AttachmentProposal,
        now: DateTime<Utc>,
    ) -> Result<Self, AttachmentError> {
        let kind: ResourceKind = proposal.kind.parse()?;
        let attachment_id = AttachmentId::from_reference(&proposal.attachment_ref)?;

        for property in kind.required_properties() {
            let present = proposal
                .properties
                .get(*property)
                .map(|v| !v.trim().is_empty())
                .unwrap_or(false);
            if !present {
                return Err(AttachmentError::MissingProperty { kind, property });
            }
        }

        if now >= proposal.expires_at {
            return Err(AttachmentError::Expired {
                expires_at: proposal.expires_at,
            });
        }

        let identity = proposal
            .properties
            .get(kind.identity_property())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();

        Ok(Self {
            attachment_id,
            resource_key: ResourceKey::new(kind, &identity),
            kind,
            task_ref: proposal.task_ref,
            expires_at: proposal.expires_at,
            accepted_at: now,
            properties: proposal.properties,
            status: AttachmentStatus::Pending,
        })
    }

    // ========================================================================
    // Aggregate Commands (State Mutations)
    // ========================================================================

    /// Pending -> Attached
    pub fn mark_attached(&mut self) -> Result<(), AttachmentError> {
        if self.status != AttachmentStatus::Pending {
            return Err(AttachmentError::InvalidStateTransition {
                from: self.status.as_str(),
                to: "attached",
            });
        }
        self.status = AttachmentStatus::Attached;
        Ok(())
    }

    /// Pending -> Errored, recording what discovery actually found
    pub fn mark_errored(&mut self, cause: IdentityMismatch) -> Result<(), AttachmentError> {
        if self.status != AttachmentStatus::Pending {
            return Err(AttachmentError::InvalidStateTransition {
                from: self.status.as_str(),
                to: "errored",
            });
        }
        self.status = AttachmentStatus::Errored { cause };
        Ok(())
    }

    // ========================================================================
    // Aggregate Queries (State Inspection)
    // ========================================================================

    pub fn status(&self) -> &AttachmentStatus {
        &self.status
    }

    pub fn last_error(&self) -> Option<&IdentityMismatch> {
        match &self.status {
            AttachmentStatus::Errored { cause } => Some(cause),
            _ => None,
        }
    }

    /// Still waiting on discovery (neither confirmed nor mismatched)
    pub fn awaiting_discovery(&self) -> bool {
        self.status == AttachmentStatus::Pending
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Identity the control plane declared (e.g. the volume ID)
    pub fn expected_identity(&self) -> &str {
        self.property(self.kind.identity_property())
            .map(str::trim)
            .unwrap_or_default()
    }

    /// Where discovery should look (e.g. the device name)
    pub fn device_locator(&self) -> &str {
        self.property(self.kind.locator_property())
            .map(str::trim)
            .unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left until the deadline, zero once it has passed
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("Unrecognized resource kind: {0}")]
    UnrecognizedKind(String),

    #[error("Invalid attachment reference: '{0}'")]
    InvalidReference(String),

    #[error("Missing required property '{property}' for {kind} attachment")]
    MissingProperty {
        kind: ResourceKind,
        property: &'static str,
    },

    #[error("Attachment proposal already expired at {expires_at}")]
    Expired { expires_at: DateTime<Utc> },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },
}

// ============================================================================
// Tests
// ============================================================================
