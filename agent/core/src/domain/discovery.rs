// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Discovery Probe Contract
//!
//! A `DiscoveryProbe` answers one question for one resource kind: is the
//! declared resource present on this host, and is it the one the control
//! plane said it would be?
//!
//! Implementations must keep "not there yet" (`NotFound`, or any
//! `DiscoveryError`) apart from "something else is there" (`Mismatch`). The
//! engine retries the former on every scan tick and records the latter as a
//! sticky error.
//!
//! Implementations carry their own bound on the underlying host call; a
//! timed-out probe is reported as `DiscoveryError::Timeout`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use crate::domain::attachment::{AttachmentRecord, ResourceKind};

/// What discovery is asked to confirm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTarget {
    /// Identity the control plane declared (e.g. "vol-0abc")
    pub expected_identity: String,
    /// Where to look (e.g. "/dev/nvme1n1" or "xvdf")
    pub device_locator: String,
}

impl DiscoveryTarget {
    pub fn for_record(record: &AttachmentRecord) -> Self {
        Self {
            expected_identity: record.expected_identity().to_string(),
            device_locator: record.device_locator().to_string(),
        }
    }
}

/// Result of a completed probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Confirmed,
    NotFound,
    Mismatch { found: String },
}

/// Transient probe failures, retried on the next scan
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Discovery probe failed: {0}")]
    ProbeFailed(String),

    #[error("Unrecognized probe output: {0}")]
    MalformedOutput(String),

    #[error("Failed to launch discovery utility: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DiscoveryProbe: Send + Sync {
    /// Probe the host for `target`
    async fn confirm(&self, target: &DiscoveryTarget) -> Result<DiscoveryOutcome, DiscoveryError>;
}

/// Probes keyed by the resource kind they understand
///
/// A kind with no registered probe is unrecognized for this agent build.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: HashMap<ResourceKind, Arc<dyn DiscoveryProbe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(mut self, kind: ResourceKind, probe: Arc<dyn DiscoveryProbe>) -> Self {
        self.probes.insert(kind, probe);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Option<&Arc<dyn DiscoveryProbe>> {
        self.probes.get(&kind)
    }

    pub fn supports(&self, kind: ResourceKind) -> bool {
        self.probes.contains_key(&kind)
    }
}
