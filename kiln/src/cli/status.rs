// kiln/src/cli/status.rs
//! Live status lines for a running install.
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};

use colored::Colorize;
use kiln_common::pipeline::{PipelineEvent, Stage};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
enum JobStatus {
    Queued,
    Fetching,
    Stage(Stage),
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    fn colored_state(&self) -> colored::ColoredString {
        match self {
            JobStatus::Queued => "queued".dimmed(),
            JobStatus::Fetching => "fetching".cyan(),
            JobStatus::Stage(Stage::Configuring) => "configure".yellow(),
            JobStatus::Stage(Stage::Building) => "build".yellow(),
            JobStatus::Stage(Stage::Installing) => "install".yellow(),
            JobStatus::Stage(Stage::PostInstall(_)) => "postinst".yellow(),
            JobStatus::Stage(Stage::Pending) => "pending".dimmed(),
            JobStatus::Success => "done".green(),
            JobStatus::Failed => "failed".red(),
            JobStatus::Skipped => "skipped".magenta(),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

struct StatusDisplay {
    jobs: HashMap<String, JobStatus>,
    job_order: Vec<String>,
    total_jobs: usize,
    redraw: bool,
    last_line_count: usize,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            job_order: Vec::new(),
            total_jobs: 0,
            redraw: io::stdout().is_terminal(),
            last_line_count: 0,
        }
    }

    fn update(&mut self, target_id: &str, status: JobStatus) {
        if !self.jobs.contains_key(target_id) {
            self.job_order.push(target_id.to_string());
        }
        let changed = self.jobs.get(target_id) != Some(&status);
        self.jobs.insert(target_id.to_string(), status.clone());
        if !changed {
            return;
        }
        if self.redraw {
            self.render();
        } else {
            println!("{:<10} {}", status.colored_state(), target_id.cyan());
        }
    }

    fn render(&mut self) {
        let mut out = io::stdout().lock();
        for _ in 0..self.last_line_count {
            // Move up one line and clear it
            let _ = write!(out, "\x1b[1A\x1b[2K");
        }
        for name in &self.job_order {
            if let Some(status) = self.jobs.get(name) {
                let _ = writeln!(out, "{:<10} {}", status.colored_state(), name.cyan());
            }
        }
        let finished = self.jobs.values().filter(|s| s.is_finished()).count();
        let _ = writeln!(out, "{}", self.progress_bar(finished));
        let _ = out.flush();
        self.last_line_count = self.job_order.len() + 1;
    }

    fn progress_bar(&self, finished: usize) -> String {
        if self.total_jobs == 0 {
            return String::new();
        }
        let width = 20;
        let filled = (finished * width) / self.total_jobs;
        format!(
            "{}{} {}/{}",
            "▍".repeat(filled).green(),
            "·".repeat(width - filled).dimmed(),
            finished,
            self.total_jobs
        )
    }
}

/// Consumes pipeline events until the run finishes or every sender is gone. Failure details are
/// held back and printed after the status lines.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();
    let mut logs_buffer = Vec::new();

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::PipelineStarted { total_jobs } => {
                    display.total_jobs = total_jobs;
                    println!("{}", "Starting build...".cyan().bold());
                }
                PipelineEvent::JobDispatched { target_id } => {
                    display.update(&target_id, JobStatus::Queued);
                }
                PipelineEvent::FetchStarted { target_id, url } => {
                    debug!("[{}] fetching {}", target_id, url);
                    display.update(&target_id, JobStatus::Fetching);
                }
                PipelineEvent::FetchRetry {
                    target_id,
                    url,
                    attempt,
                    error,
                } => {
                    logs_buffer.push(format!(
                        "{} {} attempt {} for {}: {}",
                        "Retrying:".yellow(),
                        target_id.cyan(),
                        attempt,
                        url,
                        error
                    ));
                }
                PipelineEvent::FetchFinished { .. } => {}
                PipelineEvent::StageStarted { target_id, stage } => {
                    display.update(&target_id, JobStatus::Stage(stage));
                }
                PipelineEvent::StageFinished { .. } => {}
                PipelineEvent::ConfigWritten { target_id, path } => {
                    logs_buffer.push(format!("{} {}: {}", "Wrote".green(), target_id.cyan(), path));
                }
                PipelineEvent::JobSuccess { target_id } => {
                    display.update(&target_id, JobStatus::Success);
                }
                PipelineEvent::JobFailed { target_id, error } => {
                    display.update(&target_id, JobStatus::Failed);
                    logs_buffer.push(format!(
                        "{} {}: {}",
                        "Failed:".red().bold(),
                        target_id.cyan(),
                        error.red()
                    ));
                }
                PipelineEvent::JobSkipped {
                    target_id,
                    failed_dependency,
                } => {
                    display.update(&target_id, JobStatus::Skipped);
                    logs_buffer.push(format!(
                        "{} {}: dependency '{}' failed",
                        "Skipped:".magenta(),
                        target_id.cyan(),
                        failed_dependency
                    ));
                }
                PipelineEvent::LogWarn { message } => {
                    logs_buffer.push(format!("{} {}", "Warning:".yellow(), message));
                }
                PipelineEvent::PipelineFinished { .. } => break,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Status display lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    for line in logs_buffer {
        println!("{line}");
    }
}
