// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Attachment data model, outcome events and the contracts the
//! reconciliation engine depends on.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and invariants, no I/O

pub mod attachment;
pub mod discovery;
pub mod events;
pub mod node_config;
pub mod repository;
