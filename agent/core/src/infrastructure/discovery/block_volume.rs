// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Block Volume Discovery Probe
//!
//! Confirms a block-storage volume by asking a host identification utility
//! (e.g. `ebsnvme-id`) which volume sits behind a device node. The utility is
//! invoked as `<command> <device path>` and must print a line of the form
//! `identity: <volume id>`.
//!
//! - Device node absent: `NotFound` (not yet enumerated, retried).
//! - Utility fails, times out or prints nothing usable: transient error.
//! - The timeout bounds the whole probe, device lookup included.
//! - Identity differs from the declared volume: `Mismatch`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::discovery::{DiscoveryError, DiscoveryOutcome, DiscoveryProbe, DiscoveryTarget};
use crate::domain::node_config::BlockVolumeProbeConfig;

pub struct BlockVolumeProbe {
    command: String,
    timeout: Duration,
    device_root: PathBuf,
}

impl BlockVolumeProbe {
    pub fn new(command: impl Into<String>, timeout: Duration, device_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            timeout,
            device_root: device_root.into(),
        }
    }

    pub fn from_config(config: &BlockVolumeProbeConfig) -> Self {
        Self::new(config.command.clone(), config.timeout, config.device_root.clone())
    }

    /// Absolute locators are used as-is, bare names ("xvdf") live under the device root
    pub fn device_path(&self, locator: &str) -> PathBuf {
        let locator = Path::new(locator);
        if locator.is_absolute() {
            locator.to_path_buf()
        } else {
            self.device_root.join(locator)
        }
    }

    async fn inspect(&self, target: &DiscoveryTarget) -> Result<DiscoveryOutcome, DiscoveryError> {
        let device = self.device_path(&target.device_locator);

        if !tokio::fs::try_exists(&device).await? {
            debug!(device = %device.display(), "Device node not present yet");
            return Ok(DiscoveryOutcome::NotFound);
        }

        let found = self.read_identity(&device).await?;
        if identities_match(&target.expected_identity, &found) {
            Ok(DiscoveryOutcome::Confirmed)
        } else {
            Ok(DiscoveryOutcome::Mismatch { found })
        }
    }

    async fn read_identity(&self, device: &Path) -> Result<String, DiscoveryError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg(device)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = cmd.output().await?;

        if !output.status.success() {
            return Err(DiscoveryError::ProbeFailed(format!(
                "{} {} exited with {}: {}",
                self.command,
                device.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_identity(&stdout).ok_or_else(|| DiscoveryError::MalformedOutput(stdout.trim().to_string()))
    }
}

#[async_trait]
impl DiscoveryProbe for BlockVolumeProbe {
    async fn confirm(&self, target: &DiscoveryTarget) -> Result<DiscoveryOutcome, DiscoveryError> {
        // Dropping the inner future on timeout kills the utility (kill_on_drop)
        tokio::time::timeout(self.timeout, self.inspect(target))
            .await
            .map_err(|_| DiscoveryError::Timeout(self.timeout))?
    }
}

/// Extract the value of the first `identity: <value>` line
pub fn parse_identity(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        if key.trim().eq_ignore_ascii_case("identity") && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// NVMe controllers report "vol0abc" for volume "vol-0abc"
pub fn identities_match(expected: &str, found: &str) -> bool {
    normalize_volume_id(expected) == normalize_volume_id(found)
}

fn normalize_volume_id(id: &str) -> String {
    let id = id.trim();
    match id.strip_prefix("vol-") {
        Some(rest) => format!("vol{}", rest),
        None => id.to_string(),
    }
}
