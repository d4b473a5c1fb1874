// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Proposal feed
//!
//! Newline-delimited JSON, one instruction per line. A line is either an
//! attachment proposal:
//!
//! ```json
//! {"attachmentRef":"arn:aws:ecs:us-east-1:123:attachment/abc","kind":"ebs","taskRef":"task-1","properties":{"volumeId":"vol-0abc","deviceName":"/dev/xvdf"},"expiresAt":"2026-01-01T00:00:00Z"}
//! ```
//!
//! or an administrative removal: `{"remove":"ebs:vol-0abc"}`.
//! Blank lines and lines starting with `#` are skipped.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use aegis_node_agent_core::domain::attachment::{AttachmentProposal, ResourceKey, ResourceKind};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedInstruction {
    Propose(AttachmentProposal),
    Remove(ResourceKey),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedLine {
    Propose(AttachmentProposal),
    Remove { remove: String },
}

/// Parse one feed line; `Ok(None)` for blank and comment lines
pub fn parse_line(line: &str) -> Result<Option<FeedInstruction>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let parsed: FeedLine =
        serde_json::from_str(line).context("Line is neither a proposal nor a removal")?;

    match parsed {
        FeedLine::Propose(proposal) => Ok(Some(FeedInstruction::Propose(proposal))),
        FeedLine::Remove { remove } => parse_resource_key(&remove).map(|key| Some(FeedInstruction::Remove(key))),
    }
}

/// `"<kind>:<identity>"`, where kind may be any accepted alias
pub fn parse_resource_key(value: &str) -> Result<ResourceKey> {
    let (kind, identity) = value
        .split_once(':')
        .ok_or_else(|| anyhow!("Resource key '{}' must look like '<kind>:<identity>'", value))?;

    let identity = identity.trim();
    if identity.is_empty() {
        return Err(anyhow!("Resource key '{}' has an empty identity", value));
    }

    let kind: ResourceKind = kind.trim().parse()?;
    Ok(ResourceKey::new(kind, identity))
}
