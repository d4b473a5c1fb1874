// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use aegis_node_agent_core::application::attachment_reconciler::{
    AttachmentReconciler, AttachmentReconcilerHandle, ReconcilerError,
};
use aegis_node_agent_core::domain::attachment::{
    properties, AttachmentProposal, AttachmentStatus, ResourceKey, ResourceKind,
};
use aegis_node_agent_core::domain::discovery::{
    DiscoveryError, DiscoveryOutcome, DiscoveryProbe, DiscoveryTarget, ProbeRegistry,
};
use aegis_node_agent_core::domain::events::{AttachmentEvent, AttachmentFailureReason};
use aegis_node_agent_core::domain::node_config::ReconcilerConfig;
use aegis_node_agent_core::domain::repository::AttachmentStore;
use aegis_node_agent_core::infrastructure::event_bus::{DomainEvent, EventBus, EventReceiver};
use aegis_node_agent_core::infrastructure::repositories::InMemoryAttachmentStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Replays scripted outcomes per volume; the last one repeats.
/// Every answer is held back by `delay` to simulate a slow host utility.
#[derive(Default)]
struct ScriptedProbe {
    scripts: Mutex<HashMap<String, VecDeque<DiscoveryOutcome>>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn script(&self, volume: &str, outcomes: Vec<DiscoveryOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(volume.to_string(), outcomes.into_iter().collect());
    }

    fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryProbe for ScriptedProbe {
    async fn confirm(&self, target: &DiscoveryTarget) -> Result<DiscoveryOutcome, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&target.expected_identity).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(outcome.unwrap_or(DiscoveryOutcome::NotFound))
    }
}

struct Harness {
    store: Arc<InMemoryAttachmentStore>,
    probe: Arc<ScriptedProbe>,
    events: EventReceiver,
    handle: AttachmentReconcilerHandle,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(scan_interval: Duration) -> Self {
        let store = Arc::new(InMemoryAttachmentStore::new());
        let probe = Arc::new(ScriptedProbe::default());
        let event_bus = EventBus::new(64);
        let events = event_bus.subscribe();

        let config = ReconcilerConfig {
            scan_interval,
            ..ReconcilerConfig::default()
        };
        let reconciler = AttachmentReconciler::new(
            store.clone(),
            ProbeRegistry::new().with_probe(ResourceKind::ElasticBlockStorage, probe.clone()),
            event_bus,
            &config,
            CancellationToken::new(),
        );
        let handle = reconciler.handle();
        let task = reconciler.start();

        Self { store, probe, events, handle, task }
    }

    async fn next_event(&mut self, wait: Duration) -> Option<AttachmentEvent> {
        match timeout(wait, self.events.recv()).await {
            Ok(Ok(DomainEvent::Attachment(event))) => Some(event),
            _ => None,
        }
    }

    async fn shutdown(self) {
        self.handle.stop();
        let _ = timeout(Duration::from_secs(2), self.task).await;
    }
}

fn volume_proposal(volume: &str, expires_in: chrono::Duration) -> AttachmentProposal {
    AttachmentProposal {
        attachment_ref: format!("arn:aws:ecs:us-west-2:123456789012:attachment/{}-att", volume),
        kind: "ebs".to_string(),
        task_ref: Some("task-1".to_string()),
        properties: BTreeMap::from([
            (properties::VOLUME_ID.to_string(), volume.to_string()),
            (properties::DEVICE_NAME.to_string(), "/dev/nvme1n1".to_string()),
        ]),
        expires_at: Utc::now() + expires_in,
    }
}

fn key(volume: &str) -> ResourceKey {
    ResourceKey::new(ResourceKind::ElasticBlockStorage, volume)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_volume_confirmed_on_first_scan() {
    let mut h = Harness::start(Duration::from_millis(500));
    h.probe.script("vol-1", vec![DiscoveryOutcome::Confirmed]);

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10)))
        .unwrap();

    let event = h.next_event(Duration::from_millis(1500)).await.expect("confirmation event");
    match event {
        AttachmentEvent::AttachmentConfirmed { resource_key, task_ref, attachment_id, .. } => {
            assert_eq!(resource_key, key("vol-1"));
            assert_eq!(task_ref.as_deref(), Some("task-1"));
            assert_eq!(attachment_id.as_str(), "vol-1-att");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(h.store.is_empty());
    assert!(eventually(|| !h.handle.is_scanning()).await);
    assert!(h.next_event(Duration::from_millis(100)).await.is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn test_volume_expires_before_any_scan() {
    let mut h = Harness::start(Duration::from_secs(60));
    let proposal = volume_proposal("vol-1", chrono::Duration::milliseconds(30));
    let deadline = proposal.expires_at;

    h.handle.handle_attachment_proposal(proposal).unwrap();

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    match event {
        AttachmentEvent::AttachmentFailed { resource_key, reason, failed_at, .. } => {
            assert_eq!(resource_key, key("vol-1"));
            assert_eq!(reason, AttachmentFailureReason::Expired);
            assert!(failed_at >= deadline);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(h.store.is_empty());
    assert_eq!(h.probe.calls(), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn test_unconfirmed_attachment_is_not_removed_before_deadline() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::milliseconds(400)))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.store.len(), 1);
    assert!(h.probe.calls() > 0);

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    assert_eq!(event.outcome(), "expired");
    assert!(h.store.is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_proposals_keep_first() {
    let h = Harness::start(Duration::from_secs(60));

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10)))
        .unwrap();
    let mut second = volume_proposal("vol-1", chrono::Duration::seconds(20));
    second.attachment_ref = "arn:aws:ecs:us-west-2:123456789012:attachment/second".to_string();
    h.handle.handle_attachment_proposal(second).unwrap();

    assert!(eventually(|| h.store.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pending = h.store.all_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attachment_id.as_str(), "vol-1-att");
    h.shutdown().await;
}

#[tokio::test]
async fn test_mismatch_reported_at_expiry() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.probe.script("vol-1", vec![DiscoveryOutcome::Mismatch { found: "vol-2".to_string() }]);

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::milliseconds(300)))
        .unwrap();

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    match event {
        AttachmentEvent::AttachmentFailed { reason, .. } => match reason {
            AttachmentFailureReason::Mismatch { mismatch } => {
                assert_eq!(mismatch.expected, "vol-1");
                assert_eq!(mismatch.found, "vol-2");
                assert_eq!(mismatch.locator, "/dev/nvme1n1");
            }
            other => panic!("expected mismatch, got {:?}", other),
        },
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(h.store.is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn test_mismatch_is_sticky() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.probe.script(
        "vol-1",
        vec![
            DiscoveryOutcome::Mismatch { found: "vol-2".to_string() },
            DiscoveryOutcome::Confirmed,
        ],
    );

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::milliseconds(400)))
        .unwrap();

    let mut errored = false;
    for _ in 0..100 {
        if let Some(record) = h.store.get(&key("vol-1")).await.unwrap() {
            if matches!(record.status(), AttachmentStatus::Errored { .. }) {
                errored = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(errored);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let record = h.store.get(&key("vol-1")).await.unwrap().expect("still pending");
    assert_eq!(record.last_error().unwrap().found, "vol-2");
    assert_eq!(h.probe.calls(), 1);
    assert!(!h.handle.is_scanning());

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    assert_eq!(event.outcome(), "mismatch");
    h.shutdown().await;
}

#[tokio::test]
async fn test_unrecognized_kind_rejected_synchronously() {
    let mut h = Harness::start(Duration::from_millis(10));
    let mut proposal = volume_proposal("vol-1", chrono::Duration::seconds(10));
    proposal.kind = "elastic-inference".to_string();

    assert!(matches!(
        h.handle.handle_attachment_proposal(proposal),
        Err(ReconcilerError::InvalidProposal(_))
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.is_empty());
    assert!(!h.handle.is_scanning());
    assert!(h.next_event(Duration::from_millis(100)).await.is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn test_idle_reconciler_never_probes() {
    let h = Harness::start(Duration::from_millis(5));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.probe.calls(), 0);
    assert!(!h.handle.is_scanning());
    h.shutdown().await;
}

#[tokio::test]
async fn test_ticker_rearms_and_stops() {
    let mut h = Harness::start(Duration::from_millis(50));
    assert!(!h.handle.is_scanning());

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10)))
        .unwrap();
    assert!(eventually(|| h.handle.is_scanning()).await);

    h.probe.script("vol-1", vec![DiscoveryOutcome::Confirmed]);
    assert_eq!(h.next_event(Duration::from_secs(2)).await.unwrap().outcome(), "attached");
    assert!(eventually(|| !h.handle.is_scanning()).await);

    let calls_when_idle = h.probe.calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.probe.calls(), calls_when_idle);

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-2", chrono::Duration::seconds(10)))
        .unwrap();
    assert!(eventually(|| h.handle.is_scanning()).await);
    h.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_proposals_are_not_lost() {
    let h = Harness::start(Duration::from_secs(60));

    let mut submitters = Vec::new();
    for volume in ["vol-a", "vol-b", "vol-c", "vol-d"] {
        let handle = h.handle.clone();
        submitters.push(tokio::spawn(async move {
            handle.handle_attachment_proposal(volume_proposal(volume, chrono::Duration::seconds(10)))
        }));
    }
    for submitter in submitters {
        submitter.await.unwrap().unwrap();
    }

    assert!(eventually(|| h.store.len() == 4).await);
    h.shutdown().await;
}

#[tokio::test]
async fn test_commands_apply_in_submission_order() {
    let mut h = Harness::start(Duration::from_secs(60));

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::milliseconds(150)))
        .unwrap();
    h.handle.remove_attachment(key("vol-1")).unwrap();
    h.handle
        .handle_attachment_proposal(volume_proposal("vol-2", chrono::Duration::seconds(10)))
        .unwrap();

    assert!(eventually(|| h.store.len() == 1).await);
    assert!(h.store.get(&key("vol-1")).await.unwrap().is_none());
    assert!(h.store.get(&key("vol-2")).await.unwrap().is_some());

    // Removal disarmed vol-1's ack timer: no failure is reported past its deadline
    assert!(h.next_event(Duration::from_millis(400)).await.is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn test_task_scoped_subscription() {
    let store = Arc::new(InMemoryAttachmentStore::new());
    let probe = Arc::new(ScriptedProbe::default());
    probe.script("vol-1", vec![DiscoveryOutcome::Confirmed]);
    let event_bus = EventBus::new(16);
    let mut task_events = event_bus.subscribe_task("task-7");

    let reconciler = AttachmentReconciler::new(
        store,
        ProbeRegistry::new().with_probe(ResourceKind::ElasticBlockStorage, probe),
        event_bus,
        &ReconcilerConfig {
            scan_interval: Duration::from_millis(20),
            ..ReconcilerConfig::default()
        },
        CancellationToken::new(),
    );
    let handle = reconciler.handle();
    let task = reconciler.start();

    let mut other = volume_proposal("vol-9", chrono::Duration::milliseconds(50));
    other.task_ref = Some("task-other".to_string());
    handle.handle_attachment_proposal(other).unwrap();

    let mut mine = volume_proposal("vol-1", chrono::Duration::seconds(10));
    mine.task_ref = Some("task-7".to_string());
    handle.handle_attachment_proposal(mine).unwrap();

    let event = timeout(Duration::from_secs(2), task_events.recv()).await.unwrap().unwrap();
    assert_eq!(event.task_ref(), Some("task-7"));
    assert_eq!(event.outcome(), "attached");

    handle.stop();
    let _ = timeout(Duration::from_secs(2), task).await;
}

#[tokio::test]
async fn test_parent_cancellation_stops_reconciler() {
    let root = CancellationToken::new();
    let reconciler = AttachmentReconciler::new(
        Arc::new(InMemoryAttachmentStore::new()),
        ProbeRegistry::new().with_probe(ResourceKind::ElasticBlockStorage, Arc::new(ScriptedProbe::default())),
        EventBus::new(4),
        &ReconcilerConfig::default(),
        root.child_token(),
    );
    let handle = reconciler.handle();
    let task = reconciler.start();

    root.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(matches!(
        handle.handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10))),
        Err(ReconcilerError::Stopped)
    ));
}

#[tokio::test]
async fn test_busy_reconciler_confirms_queued_proposal() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.probe.slow_down(Duration::from_millis(150));
    h.probe.script("vol-1", vec![DiscoveryOutcome::Confirmed]);
    h.probe.script("vol-2", vec![DiscoveryOutcome::Confirmed]);

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10)))
        .unwrap();
    assert!(eventually(|| h.probe.calls() >= 1).await);

    // Queued while the first pass is still waiting on the host utility
    h.handle
        .handle_attachment_proposal(volume_proposal("vol-2", chrono::Duration::seconds(10)))
        .unwrap();

    let first = h.next_event(Duration::from_secs(2)).await.expect("first confirmation");
    let second = h.next_event(Duration::from_secs(2)).await.expect("second confirmation");
    assert_eq!((first.resource_key().clone(), first.outcome()), (key("vol-1"), "attached"));
    assert_eq!((second.resource_key().clone(), second.outcome()), (key("vol-2"), "attached"));
    assert!(h.store.is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn test_proposal_expiring_in_mailbox_reports_failure() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.probe.slow_down(Duration::from_millis(400));

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10)))
        .unwrap();
    assert!(eventually(|| h.probe.calls() >= 1).await);

    // Accepted by the handle, but the actor only dequeues it after the deadline
    let late = volume_proposal("vol-2", chrono::Duration::milliseconds(50));
    let deadline = late.expires_at;
    h.handle.handle_attachment_proposal(late).unwrap();

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    match event {
        AttachmentEvent::AttachmentFailed { resource_key, reason, failed_at, task_ref, .. } => {
            assert_eq!(resource_key, key("vol-2"));
            assert_eq!(reason, AttachmentFailureReason::Expired);
            assert_eq!(task_ref.as_deref(), Some("task-1"));
            assert!(failed_at >= deadline);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(h.store.get(&key("vol-2")).await.unwrap().is_none());
    assert!(h.store.get(&key("vol-1")).await.unwrap().is_some());
    h.shutdown().await;
}

#[tokio::test]
async fn test_confirmation_after_deadline_is_a_failure() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.probe.slow_down(Duration::from_millis(400));
    h.probe.script("vol-1", vec![DiscoveryOutcome::Confirmed]);

    let proposal = volume_proposal("vol-1", chrono::Duration::milliseconds(100));
    let deadline = proposal.expires_at;
    h.handle.handle_attachment_proposal(proposal).unwrap();

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    match event {
        AttachmentEvent::AttachmentFailed { resource_key, reason, failed_at, .. } => {
            assert_eq!(resource_key, key("vol-1"));
            assert_eq!(reason, AttachmentFailureReason::Expired);
            assert!(failed_at >= deadline);
        }
        other => panic!("late answer must not confirm: {:?}", other),
    }

    // The ack timer's queued expiry finds nothing left to report
    assert!(h.store.is_empty());
    assert!(h.next_event(Duration::from_millis(200)).await.is_none());
    h.shutdown().await;
}

#[tokio::test]
async fn test_mismatch_after_deadline_is_reported_as_mismatch() {
    let mut h = Harness::start(Duration::from_millis(20));
    h.probe.slow_down(Duration::from_millis(300));
    h.probe.script("vol-1", vec![DiscoveryOutcome::Mismatch { found: "vol-9".to_string() }]);

    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::milliseconds(100)))
        .unwrap();

    let event = h.next_event(Duration::from_secs(2)).await.expect("failure event");
    match event {
        AttachmentEvent::AttachmentFailed {
            reason: AttachmentFailureReason::Mismatch { mismatch },
            ..
        } => assert_eq!(mismatch.found, "vol-9"),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(h.store.is_empty());
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_command_stream_does_not_starve_scanning() {
    let h = Harness::start(Duration::from_millis(20));
    h.handle
        .handle_attachment_proposal(volume_proposal("vol-1", chrono::Duration::seconds(10)))
        .unwrap();

    let flooding = Arc::new(AtomicBool::new(true));
    let flooder = {
        let handle = h.handle.clone();
        let flooding = flooding.clone();
        tokio::task::spawn_blocking(move || {
            while flooding.load(Ordering::SeqCst) {
                let _ = handle.remove_attachment(key("vol-unknown"));
            }
        })
    };

    let scanned = eventually(|| h.probe.calls() > 0).await;
    flooding.store(false, Ordering::SeqCst);
    flooder.await.unwrap();

    assert!(scanned);
    h.shutdown().await;
}
