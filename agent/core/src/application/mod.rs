// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod attachment_reconciler;
pub mod attachment_scan;
