// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-agent run`
//!
//! Starts the attachment reconciler, feeds it instructions from a
//! newline-delimited JSON source and prints every attachment outcome to stdout
//! as one JSON object per line.

use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_node_agent_core::application::attachment_reconciler::{
    AttachmentReconciler, AttachmentReconcilerHandle,
};
use aegis_node_agent_core::domain::attachment::ResourceKind;
use aegis_node_agent_core::domain::discovery::ProbeRegistry;
use aegis_node_agent_core::domain::node_config::AgentConfigManifest;
use aegis_node_agent_core::infrastructure::discovery::BlockVolumeProbe;
use aegis_node_agent_core::infrastructure::event_bus::{
    DomainEvent, EventBus, EventBusError, EventReceiver,
};
use aegis_node_agent_core::infrastructure::repositories::InMemoryAttachmentStore;

use crate::input::{parse_line, FeedInstruction};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Proposal feed (newline-delimited JSON); "-" reads stdin
    #[arg(long, short, value_name = "FILE", default_value = "-")]
    pub input: PathBuf,

    /// Exit once the feed is exhausted and no attachment is left pending
    #[arg(long)]
    pub exit_when_idle: bool,
}

pub async fn execute(args: RunArgs, config: AgentConfigManifest) -> Result<()> {
    let root = CancellationToken::new();
    let store = Arc::new(InMemoryAttachmentStore::new());

    let block_probe = BlockVolumeProbe::from_config(&config.spec.discovery.block_volume);
    let probes = ProbeRegistry::new().with_probe(ResourceKind::ElasticBlockStorage, Arc::new(block_probe));

    let event_bus = EventBus::new(config.spec.reconciler.event_buffer);
    let printer = spawn_event_printer(&event_bus);

    let reconciler = AttachmentReconciler::new(
        store.clone(),
        probes,
        event_bus,
        &config.spec.reconciler,
        root.child_token(),
    );
    let handle = reconciler.handle();
    let engine = reconciler.start();

    info!(
        node = %config.metadata.name,
        input = %args.input.display(),
        "AEGIS node agent started"
    );

    let reader = open_feed(&args.input).await?;
    let idle_poll = config.spec.reconciler.scan_interval;

    let result = tokio::select! {
        result = drive(reader, &handle, &store, args.exit_when_idle, idle_poll) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for interrupt signal")?;
            info!("Interrupt received, shutting down");
            Ok(())
        }
    };

    root.cancel();
    engine.await.context("Attachment reconciler task failed")?;
    // The reconciler owned the last bus sender, so the printer drains and ends
    let missed = printer.await.context("Event printer task failed")?;
    if missed > 0 {
        warn!(missed, "Some attachment outcomes were never printed");
    }

    info!("AEGIS node agent stopped");
    result
}

async fn open_feed(input: &Path) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if input.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }

    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open proposal feed {:?}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Submit every feed line, then idle until interrupted (or until nothing is pending)
async fn drive(
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    handle: &AttachmentReconcilerHandle,
    store: &InMemoryAttachmentStore,
    exit_when_idle: bool,
    idle_poll: Duration,
) -> Result<()> {
    let mut lines = reader.lines();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read proposal feed")? {
        line_no += 1;
        submit(handle, line_no, &line);
    }

    info!(lines = line_no, "Proposal feed exhausted");

    if !exit_when_idle {
        std::future::pending::<()>().await;
    }

    // Two consecutive empty observations: the first may race commands still in the mailbox
    let mut empty_polls = 0;
    while empty_polls < 2 {
        tokio::time::sleep(idle_poll).await;
        if store.is_empty() {
            empty_polls += 1;
        } else {
            empty_polls = 0;
        }
    }

    info!("No attachments pending, exiting");
    Ok(())
}

fn submit(handle: &AttachmentReconcilerHandle, line_no: usize, line: &str) {
    let instruction = match parse_line(line) {
        Ok(Some(instruction)) => instruction,
        Ok(None) => return,
        Err(e) => {
            warn!(line = line_no, error = %format!("{:#}", e), "Skipping unreadable feed line");
            return;
        }
    };

    // Rejections are already logged and counted by the handle
    let result = match instruction {
        FeedInstruction::Propose(proposal) => handle.handle_attachment_proposal(proposal),
        FeedInstruction::Remove(key) => handle.remove_attachment(key),
    };
    if let Err(e) = result {
        debug!(line = line_no, error = %e, "Feed instruction not submitted");
    }
}

fn spawn_event_printer(event_bus: &EventBus) -> JoinHandle<u64> {
    tokio::spawn(forward_events(event_bus.subscribe(), std::io::stdout()))
}

/// Write each attachment event to `out` as a JSON line until the bus closes.
/// Returns how many events were lost to lag.
async fn forward_events(mut receiver: EventReceiver, mut out: impl Write + Send) -> u64 {
    let mut missed_total = 0;
    loop {
        match receiver.recv().await {
            Ok(DomainEvent::Attachment(event)) => {
                let written = serde_json::to_string(&event)
                    .map_err(anyhow::Error::from)
                    .and_then(|json| writeln!(out, "{}", json).map_err(anyhow::Error::from));
                if let Err(e) = written {
                    warn!(
                        resource_key = %event.resource_key(),
                        error = %e,
                        "Failed to write attachment event"
                    );
                }
            }
            Err(EventBusError::Lagged(missed)) => {
                missed_total += missed;
                warn!(missed, "Event output fell behind; attachment outcomes were dropped");
            }
            Err(_) => break,
        }
    }
    missed_total
}
