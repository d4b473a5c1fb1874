// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host discovery probes, one per resource kind

pub mod block_volume;

pub use block_volume::BlockVolumeProbe;
