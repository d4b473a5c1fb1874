// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Attachment Reconciler
//!
//! Confirms that attachments proposed by the control plane actually show up on
//! this host before their deadline.
//!
//! # Concurrency model
//!
//! The reconciler is an actor: one task owns the attachment table and processes
//! a FIFO mailbox of `ReconcilerCommand`s alongside a scan ticker and the
//! shutdown token. Callers (the control-plane transport, ack timers,
//! administrative removal) only ever enqueue commands through an
//! `AttachmentReconcilerHandle`, so every mutation of the table happens on the
//! actor task in submission order.
//!
//! # Per-attachment state machine
//!
//! ```text
//! proposal accepted -> pending --confirmed--> attached (removed, success event)
//!                         |
//!                         +--mismatch--> errored (sticky, stays in the store)
//!                         |
//!                 ack timer fires -> removed (failure event: expired | mismatch)
//! ```
//!
//! The scan ticker only runs while at least one attachment is awaiting
//! discovery; with nothing to reconcile no probe is ever invoked.
//!
//! Every accepted proposal ends in exactly one event. A deadline that passes
//! while the proposal is still queued, or while a scan pass is running, ends
//! in `AttachmentFailed` even if discovery would have confirmed it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::attachment_scan::{scan_pending, ScanVerdict};
use crate::domain::attachment::{
    AttachmentError, AttachmentProposal, AttachmentRecord, ResourceKey, ResourceKind,
};
use crate::domain::discovery::ProbeRegistry;
use crate::domain::events::{AttachmentEvent, AttachmentFailureReason};
use crate::domain::node_config::ReconcilerConfig;
use crate::domain::repository::AttachmentStore;
use crate::infrastructure::event_bus::EventBus;

/// Floor for the scan interval; `tokio::time::interval` rejects zero
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Mailbox
// ============================================================================

#[derive(Debug)]
enum ReconcilerCommand {
    /// Validated proposal to insert
    Propose(AttachmentRecord),
    /// Administrative removal, no outcome reported
    Remove(ResourceKey),
    /// Ack timer fired for this key
    Expire(ResourceKey),
}

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Malformed attachment proposal: {0}")]
    InvalidProposal(#[from] AttachmentError),

    #[error("No discovery probe registered for resource kind '{0}'")]
    UnsupportedKind(ResourceKind),

    #[error("Attachment reconciler has stopped")]
    Stopped,
}

impl ReconcilerError {
    fn metric_reason(&self) -> &'static str {
        match self {
            Self::InvalidProposal(AttachmentError::Expired { .. }) => "expired",
            Self::InvalidProposal(AttachmentError::UnrecognizedKind(_)) | Self::UnsupportedKind(_) => {
                "unrecognized_kind"
            }
            Self::InvalidProposal(_) => "malformed",
            Self::Stopped => "stopped",
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap, cloneable entry point into a running reconciler
///
/// Every method returns immediately; state changes happen later on the actor.
#[derive(Clone)]
pub struct AttachmentReconcilerHandle {
    mailbox: mpsc::UnboundedSender<ReconcilerCommand>,
    probes: ProbeRegistry,
    scanning: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl AttachmentReconcilerHandle {
    /// Validate a proposal and enqueue it for insertion
    ///
    /// Fails synchronously for malformed input, an already-expired deadline
    /// or a resource kind this agent cannot probe. Duplicates are accepted
    /// here and dropped by the actor.
    pub fn handle_attachment_proposal(&self, proposal: AttachmentProposal) -> Result<(), ReconcilerError> {
        let result = self.enqueue_proposal(proposal);
        if let Err(e) = &result {
            warn!(error = %e, "Rejected attachment proposal");
            metrics::counter!("aegis_attachments_rejected_total", "reason" => e.metric_reason())
                .increment(1);
        }
        result
    }

    fn enqueue_proposal(&self, proposal: AttachmentProposal) -> Result<(), ReconcilerError> {
        let record = AttachmentRecord::from_proposal(proposal, Utc::now())?;
        if !self.probes.supports(record.kind) {
            return Err(ReconcilerError::UnsupportedKind(record.kind));
        }
        self.send(ReconcilerCommand::Propose(record))
    }

    /// Drop an attachment without reporting an outcome
    pub fn remove_attachment(&self, key: ResourceKey) -> Result<(), ReconcilerError> {
        self.send(ReconcilerCommand::Remove(key))
    }

    /// Whether the scan ticker is currently armed
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Request shutdown; the actor exits at its next wakeup
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn send(&self, command: ReconcilerCommand) -> Result<(), ReconcilerError> {
        if self.shutdown.is_cancelled() {
            return Err(ReconcilerError::Stopped);
        }
        self.mailbox.send(command).map_err(|_| ReconcilerError::Stopped)
    }
}

// ============================================================================
// Actor
// ============================================================================

pub struct AttachmentReconciler {
    store: Arc<dyn AttachmentStore>,
    probes: ProbeRegistry,
    event_bus: EventBus,
    scan_interval: Duration,
    mailbox: mpsc::UnboundedReceiver<ReconcilerCommand>,
    mailbox_tx: mpsc::UnboundedSender<ReconcilerCommand>,
    ack_timers: HashMap<ResourceKey, AbortHandle>,
    scanning: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl AttachmentReconciler {
    /// Build the actor; pass a child of the agent's root token as `shutdown`
    pub fn new(
        store: Arc<dyn AttachmentStore>,
        probes: ProbeRegistry,
        event_bus: EventBus,
        config: &ReconcilerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (mailbox_tx, mailbox) = mpsc::unbounded_channel();
        let scan_interval = if config.scan_interval < MIN_SCAN_INTERVAL {
            warn!(
                configured_ms = config.scan_interval.as_millis() as u64,
                "Scan interval below minimum, clamping to 1ms"
            );
            MIN_SCAN_INTERVAL
        } else {
            config.scan_interval
        };

        Self {
            store,
            probes,
            event_bus,
            scan_interval,
            mailbox,
            mailbox_tx,
            ack_timers: HashMap::new(),
            scanning: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    pub fn handle(&self) -> AttachmentReconcilerHandle {
        AttachmentReconcilerHandle {
            mailbox: self.mailbox_tx.clone(),
            probes: self.probes.clone(),
            scanning: self.scanning.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Spawn the actor loop
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the actor loop until the shutdown token is cancelled
    pub async fn run(mut self) {
        info!(
            scan_interval_ms = self.scan_interval.as_millis() as u64,
            "Starting attachment reconciler"
        );

        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping attachment reconciler");
                    break;
                }
                // Ahead of the mailbox so a steady command stream cannot starve scanning
                _ = ticker.tick(), if self.scanning.load(Ordering::SeqCst) => {
                    self.scan(&mut ticker).await;
                }
                command = self.mailbox.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command, &mut ticker).await;
                }
            }
        }

        self.shutdown_cleanup();
    }

    async fn handle_command(&mut self, command: ReconcilerCommand, ticker: &mut Interval) {
        match command {
            ReconcilerCommand::Propose(record) => self.accept(record, ticker).await,
            ReconcilerCommand::Remove(key) => self.remove(&key, ticker).await,
            ReconcilerCommand::Expire(key) => self.expire(&key, ticker).await,
        }
    }

    async fn accept(&mut self, record: AttachmentRecord, ticker: &mut Interval) {
        let key = record.resource_key.clone();

        match self.store.get(&key).await {
            Ok(Some(_)) => {
                warn!(resource_key = %key, "Attachment already pending, ignoring duplicate proposal");
                metrics::counter!("aegis_attachments_rejected_total", "reason" => "duplicate").increment(1);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(resource_key = %key, error = %e, "Failed to look up attachment");
                return;
            }
        }

        // The deadline may have passed while the proposal sat in the mailbox.
        // The caller was told it was accepted, so it still gets an outcome.
        let now = Utc::now();
        if record.is_expired_at(now) {
            debug!(resource_key = %key, "Attachment proposal expired while queued");
            self.resolve_failed(record, AttachmentFailureReason::Expired, now).await;
            return;
        }

        let remaining = record.remaining(now);
        let attachment_id = record.attachment_id.clone();
        if let Err(e) = self.store.add(record).await {
            error!(resource_key = %key, error = %e, "Failed to store attachment");
            return;
        }

        self.arm_ack_timer(key.clone(), remaining);
        info!(
            resource_key = %key,
            attachment_id = %attachment_id,
            deadline_ms = remaining.as_millis() as u64,
            "Accepted attachment proposal"
        );
        metrics::counter!("aegis_attachments_accepted_total").increment(1);

        self.refresh_scan_state(ticker).await;
    }

    async fn remove(&mut self, key: &ResourceKey, ticker: &mut Interval) {
        self.disarm_ack_timer(key);
        match self.store.remove(key).await {
            Ok(Some(_)) => info!(resource_key = %key, "Removed attachment"),
            Ok(None) => debug!(resource_key = %key, "Attachment to remove is not pending"),
            Err(e) => error!(resource_key = %key, error = %e, "Failed to remove attachment"),
        }
        self.refresh_scan_state(ticker).await;
    }

    async fn expire(&mut self, key: &ResourceKey, ticker: &mut Interval) {
        let record = match self.store.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(resource_key = %key, "Ack timer fired for an attachment that is already resolved");
                return;
            }
            Err(e) => {
                error!(resource_key = %key, error = %e, "Failed to look up expiring attachment");
                return;
            }
        };

        // Never expire ahead of the wall-clock deadline
        let now = Utc::now();
        if !record.is_expired_at(now) {
            debug!(resource_key = %key, "Ack timer fired early, re-arming");
            self.arm_ack_timer(key.clone(), record.remaining(now));
            return;
        }

        let reason = expiry_reason(&record);
        self.resolve_failed(record, reason, now).await;
        self.refresh_scan_state(ticker).await;
    }

    /// Terminal failure: drop the record, disarm its timer and publish why
    async fn resolve_failed(&mut self, record: AttachmentRecord, reason: AttachmentFailureReason, now: DateTime<Utc>) {
        let key = record.resource_key.clone();
        self.disarm_ack_timer(&key);
        if let Err(e) = self.store.remove(&key).await {
            error!(resource_key = %key, error = %e, "Failed to remove expired attachment");
        }

        match &reason {
            AttachmentFailureReason::Mismatch { mismatch } => error!(
                resource_key = %key,
                attachment_id = %record.attachment_id,
                expected = %mismatch.expected,
                found = %mismatch.found,
                locator = %mismatch.locator,
                "Attachment expired with a different resource at its device location"
            ),
            AttachmentFailureReason::Expired => warn!(
                resource_key = %key,
                attachment_id = %record.attachment_id,
                expires_at = %record.expires_at,
                "Attachment was not confirmed before its deadline"
            ),
        }

        metrics::counter!("aegis_attachments_resolved_total", "outcome" => reason.as_str()).increment(1);
        self.event_bus.publish_attachment_event(AttachmentEvent::AttachmentFailed {
            attachment_id: record.attachment_id,
            resource_key: record.resource_key,
            task_ref: record.task_ref,
            reason,
            failed_at: now,
        });
    }

    /// One discovery pass over the pending set
    async fn scan(&mut self, ticker: &mut Interval) {
        let snapshot = match self.store.all_pending().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Failed to snapshot pending attachments");
                return;
            }
        };

        for result in scan_pending(&self.probes, snapshot).await {
            let mut record = result.record;
            let key = record.resource_key.clone();

            // A slow pass can outlive the deadline; a late answer does not count
            let now = Utc::now();
            if record.is_expired_at(now) {
                let reason = match result.verdict {
                    ScanVerdict::Mismatch(mismatch) => AttachmentFailureReason::Mismatch { mismatch },
                    ScanVerdict::Confirmed | ScanVerdict::Retry => expiry_reason(&record),
                };
                self.resolve_failed(record, reason, now).await;
                continue;
            }

            match result.verdict {
                ScanVerdict::Confirmed => {
                    if let Err(e) = record.mark_attached() {
                        error!(resource_key = %key, error = %e, "Cannot confirm attachment");
                        continue;
                    }
                    self.disarm_ack_timer(&key);
                    if let Err(e) = self.store.remove(&key).await {
                        error!(resource_key = %key, error = %e, "Failed to remove confirmed attachment");
                    }

                    info!(
                        resource_key = %key,
                        attachment_id = %record.attachment_id,
                        "Attachment confirmed on host"
                    );
                    metrics::counter!("aegis_attachments_resolved_total", "outcome" => "attached").increment(1);
                    self.event_bus.publish_attachment_event(AttachmentEvent::AttachmentConfirmed {
                        attachment_id: record.attachment_id,
                        resource_key: record.resource_key,
                        task_ref: record.task_ref,
                        confirmed_at: Utc::now(),
                    });
                }
                ScanVerdict::Retry => {}
                ScanVerdict::Mismatch(mismatch) => {
                    error!(
                        resource_key = %key,
                        attachment_id = %record.attachment_id,
                        expected = %mismatch.expected,
                        found = %mismatch.found,
                        locator = %mismatch.locator,
                        "Discovery found a different resource than declared; holding attachment until its deadline"
                    );
                    if let Err(e) = record.mark_errored(mismatch) {
                        error!(resource_key = %key, error = %e, "Cannot record attachment mismatch");
                        continue;
                    }
                    if let Err(e) = self.store.update(record).await {
                        error!(resource_key = %key, error = %e, "Failed to store attachment mismatch");
                    }
                }
            }
        }

        // Next pass one full interval after this one ended, so a pass slower
        // than the interval still leaves the mailbox a turn
        ticker.reset();
        self.refresh_scan_state(ticker).await;
    }

    /// Arm the ticker when work appears and disarm it when nothing awaits discovery
    async fn refresh_scan_state(&mut self, ticker: &mut Interval) {
        let pending = match self.store.all_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to inspect pending attachments");
                return;
            }
        };
        metrics::gauge!("aegis_attachments_pending").set(pending.len() as f64);

        let awaiting = pending.iter().any(AttachmentRecord::awaiting_discovery);
        let was_scanning = self.scanning.swap(awaiting, Ordering::SeqCst);
        match (was_scanning, awaiting) {
            (false, true) => {
                // First tick one full interval from now
                ticker.reset();
                debug!("Scan ticker armed");
            }
            (true, false) => debug!("Scan ticker stopped, nothing awaiting discovery"),
            _ => {}
        }
    }

    fn arm_ack_timer(&mut self, key: ResourceKey, delay: Duration) {
        let mailbox = self.mailbox_tx.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The reconciler may already be gone; a late timer is a no-op
            let _ = mailbox.send(ReconcilerCommand::Expire(timer_key));
        });

        if let Some(previous) = self.ack_timers.insert(key, timer.abort_handle()) {
            previous.abort();
        }
    }

    fn disarm_ack_timer(&mut self, key: &ResourceKey) {
        if let Some(timer) = self.ack_timers.remove(key) {
            timer.abort();
        }
    }

    fn shutdown_cleanup(&mut self) {
        let armed = self.ack_timers.len();
        for (_, timer) in self.ack_timers.drain() {
            timer.abort();
        }
        self.mailbox.close();
        self.scanning.store(false, Ordering::SeqCst);
        info!(disarmed_timers = armed, "Attachment reconciler stopped");
    }
}

/// Mismatch if discovery ever saw the wrong resource, otherwise a plain timeout
fn expiry_reason(record: &AttachmentRecord) -> AttachmentFailureReason {
    match record.last_error() {
        Some(mismatch) => AttachmentFailureReason::Mismatch {
            mismatch: mismatch.clone(),
        },
        None => AttachmentFailureReason::Expired,
    }
}
