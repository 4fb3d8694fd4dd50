//! JSONL replay of inbound traffic
//!
//! One tagged JSON object per line:
//! `{"type":"report", "vehicle_id": ..., "latitude": ..., "longitude": ..., "timestamp": ...}`
//! or `{"type":"gate_contact", "vehicle_id": ..., "gate_id": ..., "timestamp": ...}`.
//! Blank lines and lines starting with `#` are ignored.

use crate::services::dispatcher::{DispatchHandle, Inbound};
use anyhow::Context;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub lines: u64,
    pub submitted: u64,
    pub malformed: u64,
}

/// Parse one line; `Ok(None)` for blank and comment lines
pub fn parse_line(line: &str) -> Result<Option<Inbound>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Feed every line of `reader` into the dispatcher
pub async fn replay_reader<R: AsyncBufRead + Unpin>(
    reader: R,
    dispatch: &DispatchHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read replay input")?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(lines = stats.lines, "replay_interrupted");
                    break;
                }
                continue;
            }
        };
        let Some(line) = line else { break };
        stats.lines += 1;

        match parse_line(&line) {
            Ok(Some(msg)) => {
                if !dispatch.submit(msg).await {
                    warn!(line = stats.lines, "replay_dispatcher_closed");
                    break;
                }
                stats.submitted += 1;
            }
            Ok(None) => {}
            Err(e) => {
                stats.malformed += 1;
                warn!(line = stats.lines, error = %e, "replay_line_malformed");
            }
        }
    }

    Ok(stats)
}

/// Replay a JSONL file
pub async fn replay_file(
    path: &str,
    dispatch: &DispatchHandle,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ReplayStats> {
    let file = File::open(path).await.with_context(|| format!("Failed to open replay input {path}"))?;
    info!(path = %path, "replay_started");
    let stats = replay_reader(BufReader::new(file), dispatch, shutdown).await?;
    info!(
        path = %path,
        lines = stats.lines,
        submitted = stats.submitted,
        malformed = stats.malformed,
        "replay_finished"
    );
    Ok(stats)
}
