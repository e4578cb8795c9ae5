//! Structured logging for training with tracing.
//!
//! JSON or pretty console output, per-step loss breakdowns, and warnings for
//! non-finite or collapsing losses.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{IoResultExt, TrainResult};

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for production monitoring.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pointjem_train=info,pointjem_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for local runs/debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pointjem_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// One line of `stats.txt`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepMetrics {
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub loss_dia: f64,
    pub loss_off: f64,
    pub loss_ti: f64,
    /// Whole seconds since training started.
    pub time: u64,
    pub lr: f64,
}

/// Log a training step with structured metrics.
///
/// Emits an error for NaN/infinite losses and a warning when the diagonal
/// entropy term reaches zero, i.e. every sample lands in the same bins.
pub fn log_training_step(metrics: &StepMetrics) {
    let span = span!(Level::INFO, "training_step", step = metrics.step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            loss_dia = metrics.loss_dia,
            loss_off = metrics.loss_off,
            loss_ti = metrics.loss_ti,
            step = metrics.step,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        epoch = metrics.epoch,
        loss = metrics.loss,
        loss_dia = metrics.loss_dia,
        loss_off = metrics.loss_off,
        loss_ti = metrics.loss_ti,
        lr = metrics.lr,
        time = metrics.time,
        "Training step completed"
    );

    if metrics.loss_dia > -1e-6 && metrics.loss_dia != 0.0 {
        warn!(
            loss_dia = metrics.loss_dia,
            step = metrics.step,
            "Diagonal entropy near zero - codes may be collapsing onto a single bin"
        );
    }

    debug!(
        step = metrics.step,
        loss_breakdown = format!(
            "dia: {:.4}, off: {:.4}, ti: {:.4}",
            metrics.loss_dia, metrics.loss_off, metrics.loss_ti
        ),
        "Training diagnostics"
    );
}

/// Appends rate-limited JSON lines to `stats.txt`.
pub struct StatsWriter {
    file: File,
    path: PathBuf,
    start: Instant,
    last: Instant,
    every: Duration,
}

impl StatsWriter {
    /// Opens `<dir>/stats.txt` for appending. Lines are written at most once
    /// per `log_freq_secs`; 0 writes every step.
    pub fn open(dir: &Path, log_freq_secs: u64) -> TrainResult<Self> {
        std::fs::create_dir_all(dir).with_path(dir)?;
        let path = dir.join("stats.txt");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        let now = Instant::now();
        Ok(Self {
            file,
            path,
            start: now,
            last: now,
            every: Duration::from_secs(log_freq_secs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole seconds since the writer was opened.
    pub fn elapsed_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    /// Writes one free-form line, e.g. the command line of the run.
    pub fn write_header(&mut self, line: &str) -> TrainResult<()> {
        writeln!(self.file, "{}", line).with_path(&self.path)
    }

    /// Returns whether a line was written.
    pub fn record(&mut self, metrics: &StepMetrics) -> TrainResult<bool> {
        let now = Instant::now();
        if !self.every.is_zero() && now.duration_since(self.last) < self.every {
            return Ok(false);
        }
        let line = serde_json::to_string(metrics)?;
        writeln!(self.file, "{}", line).with_path(&self.path)?;
        self.last = now;
        Ok(true)
    }
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(epoch: usize, path: &str, loss: f64) {
    info!(
        epoch = epoch,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}
