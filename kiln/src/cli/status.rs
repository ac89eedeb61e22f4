// kiln/src/cli/status.rs
// Prints pipeline events as they arrive.
use std::collections::HashMap;
use std::time::Instant;

use colored::*;
use kiln_common::pipeline::{PipelineEvent, PipelineState};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

fn state_indicator(state: PipelineState) -> ColoredString {
    match state {
        PipelineState::Pending => "·".dimmed(),
        PipelineState::Fetching => "↓".yellow(),
        PipelineState::Verifying => "#".yellow(),
        PipelineState::Unpacking => "⇲".blue(),
        PipelineState::Configuring | PipelineState::Building => "⚙".blue(),
        PipelineState::Installing => "⚙".magenta(),
        PipelineState::Installed => "✓".green().bold(),
        PipelineState::Failed => "✗".red().bold(),
    }
}

fn colored_state(state: PipelineState) -> ColoredString {
    let label = state.to_string();
    match state {
        PipelineState::Pending => label.dimmed(),
        PipelineState::Fetching | PipelineState::Verifying => label.yellow(),
        PipelineState::Unpacking | PipelineState::Configuring | PipelineState::Building => {
            label.blue()
        }
        PipelineState::Installing => label.magenta(),
        PipelineState::Installed => label.green().bold(),
        PipelineState::Failed => label.red().bold(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}", value, UNITS[unit_idx])
    }
}

/// Totals collected while printing, reported once the channel closes.
#[derive(Debug, Default)]
pub struct StatusSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub warnings: Vec<String>,
    pub downloaded_bytes: u64,
}

/// Renders one event as a status line, or `None` for events that are only
/// interesting in the debug log.
fn render_event(event: &PipelineEvent, started: &HashMap<String, Instant>) -> Option<String> {
    match event {
        PipelineEvent::StateChanged { target_id, state } => Some(format!(
            "{} {} {}",
            state_indicator(*state),
            target_id.cyan(),
            colored_state(*state)
        )),
        PipelineEvent::DependencyPlanned {
            target_id,
            dependency,
        } => Some(format!(
            "{} {} needs {}",
            "+".dimmed(),
            target_id.cyan(),
            dependency.cyan()
        )),
        PipelineEvent::DownloadCached { target_id, path } => Some(format!(
            "  {} using cached {}",
            target_id.cyan(),
            path.display().to_string().dimmed()
        )),
        PipelineEvent::DownloadFinished {
            target_id,
            size_bytes,
            ..
        } => Some(format!(
            "  {} downloaded {}",
            target_id.cyan(),
            format_bytes(*size_bytes)
        )),
        PipelineEvent::DownloadFailed {
            target_id, error, ..
        } => Some(format!(
            "{} {}: {}",
            "Download failed:".red(),
            target_id.cyan(),
            error.red()
        )),
        PipelineEvent::JobSuccess { target_id, version } => {
            let elapsed = started
                .get(target_id)
                .map(|t| format!(" in {:.1}s", t.elapsed().as_secs_f64()))
                .unwrap_or_default();
            Some(format!(
                "{}: {} {}{}",
                "Installed".green(),
                target_id.cyan(),
                version,
                elapsed
            ))
        }
        PipelineEvent::JobFailed {
            target_id,
            state,
            error,
        } => Some(format!(
            "{} {} ({}): {}",
            "✗".red().bold(),
            target_id.cyan(),
            state,
            error.red()
        )),
        PipelineEvent::LogWarn { target_id, message } => Some(format!(
            "{} {}: {}",
            "Warning:".yellow(),
            target_id.cyan(),
            message.yellow()
        )),
        PipelineEvent::DownloadStarted { .. } | PipelineEvent::StepStarted { .. } => None,
    }
}

/// Prints events until every sender is gone.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) -> StatusSummary {
    let mut summary = StatusSummary::default();
    let mut started: HashMap<String, Instant> = HashMap::new();

    loop {
        match event_rx.recv().await {
            Ok(event) => {
                match &event {
                    PipelineEvent::StateChanged {
                        target_id,
                        state: PipelineState::Pending,
                    } => {
                        started.entry(target_id.clone()).or_insert_with(Instant::now);
                    }
                    PipelineEvent::DownloadStarted { target_id, url } => {
                        debug!("[{}] downloading {}", target_id, url);
                    }
                    PipelineEvent::StepStarted { target_id, command } => {
                        debug!("[{}] $ {}", target_id, command);
                    }
                    PipelineEvent::DownloadFinished { size_bytes, .. } => {
                        summary.downloaded_bytes += size_bytes;
                    }
                    PipelineEvent::JobSuccess { target_id, .. } => {
                        summary.succeeded.push(target_id.clone());
                    }
                    PipelineEvent::JobFailed { target_id, .. } => {
                        summary.failed.push(target_id.clone());
                    }
                    PipelineEvent::LogWarn { target_id, message } => {
                        summary.warnings.push(format!("{target_id}: {message}"));
                    }
                    _ => {}
                }
                if let Some(line) = render_event(&event, &started) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("Status printer lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_use_decimal_units() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1_500), "1.5kB");
        assert_eq!(format_bytes(27_400_000), "27.4MB");
    }

    #[tokio::test]
    async fn summary_counts_outcomes_until_closed() {
        let (tx, rx) = broadcast::channel(16);
        let printer = tokio::spawn(handle_events(rx));
        tx.send(PipelineEvent::DownloadFinished {
            target_id: "hello".into(),
            path: "/tmp/hello.tar.gz".into(),
            size_bytes: 2048,
        })
        .unwrap();
        tx.send(PipelineEvent::JobSuccess {
            target_id: "hello".into(),
            version: "2.12.1".into(),
        })
        .unwrap();
        tx.send(PipelineEvent::JobFailed {
            target_id: "qvm-ffmpeg".into(),
            state: PipelineState::Building,
            error: "Build Error".into(),
        })
        .unwrap();
        drop(tx);

        let summary = printer.await.unwrap();
        assert_eq!(summary.succeeded, vec!["hello".to_string()]);
        assert_eq!(summary.failed, vec!["qvm-ffmpeg".to_string()]);
        assert_eq!(summary.downloaded_bytes, 2048);
    }
}
