// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Attachment Scan
//!
//! One discovery pass over a snapshot of the pending set. Probes run serially,
//! each bounded by the probe's own timeout, and every result is classified into
//! a `ScanVerdict` the reconciliation engine turns into a state transition.
//!
//! Records already carrying a mismatch are not probed again: a later correct
//! answer must not clear the error.

use crate::domain::attachment::{AttachmentRecord, IdentityMismatch};
use crate::domain::discovery::{DiscoveryOutcome, DiscoveryTarget, ProbeRegistry};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    /// Discovery found the declared resource
    Confirmed,
    /// Not visible yet, or the probe failed transiently; retry next tick
    Retry,
    /// A different resource occupies the declared location
    Mismatch(IdentityMismatch),
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    pub record: AttachmentRecord,
    pub verdict: ScanVerdict,
}

/// Probe every record in `pending` that is still awaiting discovery
pub async fn scan_pending(probes: &ProbeRegistry, pending: Vec<AttachmentRecord>) -> Vec<ScanResult> {
    let mut results = Vec::with_capacity(pending.len());

    for record in pending {
        if !record.awaiting_discovery() {
            continue;
        }

        let Some(probe) = probes.get(record.kind) else {
            // Filtered at acceptance; only reachable if the registry changed underneath us
            warn!(resource_key = %record.resource_key, kind = %record.kind, "No discovery probe registered");
            continue;
        };

        let target = DiscoveryTarget::for_record(&record);
        let verdict = match probe.confirm(&target).await {
            Ok(DiscoveryOutcome::Confirmed) => {
                record_probe_metric("confirmed");
                ScanVerdict::Confirmed
            }
            Ok(DiscoveryOutcome::NotFound) => {
                record_probe_metric("not_found");
                debug!(resource_key = %record.resource_key, "Attachment not visible on host yet");
                ScanVerdict::Retry
            }
            Ok(DiscoveryOutcome::Mismatch { found }) => {
                record_probe_metric("mismatch");
                ScanVerdict::Mismatch(IdentityMismatch {
                    expected: target.expected_identity,
                    found,
                    locator: target.device_locator,
                })
            }
            Err(e) => {
                record_probe_metric("error");
                warn!(
                    resource_key = %record.resource_key,
                    error = %e,
                    "Discovery probe failed, will retry on next scan"
                );
                ScanVerdict::Retry
            }
        };

        results.push(ScanResult { record, verdict });
    }

    results
}

fn record_probe_metric(result: &'static str) {
    metrics::counter!("aegis_discovery_probe_total", "result" => result).increment(1);
}
