// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure
//!
//! Adapters behind the domain contracts: the in-memory attachment store, the
//! event bus and host discovery probes.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure

pub mod discovery;
pub mod event_bus;
pub mod repositories;
