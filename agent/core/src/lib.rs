// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Node Agent Core
//!
//! Reconciles attachments the control plane has proposed for this host with
//! what discovery actually observes on the host.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Attachment reconciliation engine and its collaborators

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
