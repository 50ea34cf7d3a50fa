//! Transfer progress records
//!
//! Sampled by the download observer and turned into phase-band percentages
//! and human readable status lines.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Transfer status
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TransferStatus {
    /// Currently transferring
    Active,
    /// Failed
    Failed,
    /// Completed successfully
    Completed,
    /// Cancelled by user
    Cancelled,
}

/// Progress of one file transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferProgress {
    /// Remote source path
    pub source_path: String,

    /// Local destination path
    pub destination_path: PathBuf,

    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Total bytes to transfer (0 when unknown)
    pub total_bytes: u64,

    pub status: TransferStatus,

    pub started_at: DateTime<Utc>,

    /// Last update timestamp
    pub last_updated: DateTime<Utc>,

    /// Error message if failed
    pub error: Option<String>,
}

impl TransferProgress {
    pub fn new(source_path: String, destination_path: PathBuf, total_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            source_path,
            destination_path,
            transferred_bytes: 0,
            total_bytes,
            status: TransferStatus::Active,
            started_at: now,
            last_updated: now,
            error: None,
        }
    }

    /// Completed fraction in `0.0..=1.0`. Unknown totals report 0.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64).min(1.0)
    }

    /// Calculate completion percentage (0-100)
    pub fn progress_percent(&self) -> f64 {
        self.fraction() * 100.0
    }

    /// Update transferred bytes and timestamp
    pub fn update_progress(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.last_updated = Utc::now();
    }

    /// Average rate since start, in bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        let elapsed = (self.last_updated - self.started_at).num_milliseconds();
        if elapsed <= 0 {
            return 0.0;
        }
        self.transferred_bytes as f64 * 1000.0 / elapsed as f64
    }

    /// Seconds left at the average rate; `None` until a rate is known
    pub fn eta_secs(&self) -> Option<u64> {
        let rate = self.bytes_per_second();
        if rate <= 0.0 || self.total_bytes == 0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.transferred_bytes);
        Some((remaining as f64 / rate).ceil() as u64)
    }

    pub fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
        self.transferred_bytes = self.total_bytes.max(self.transferred_bytes);
        self.last_updated = Utc::now();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TransferStatus::Failed;
        self.error = Some(error);
        self.last_updated = Utc::now();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TransferStatus::Cancelled;
        self.last_updated = Utc::now();
    }

    /// e.g. `Downloading a.zip: 12.0 MiB / 48.0 MiB (25%, 4.0 MiB/s, ETA 9s)`
    pub fn status_line(&self, label: &str) -> String {
        let rate = format_bytes(self.bytes_per_second() as u64);
        if self.total_bytes == 0 {
            return format!(
                "{}: {} ({}/s)",
                label,
                format_bytes(self.transferred_bytes),
                rate
            );
        }
        let eta = match self.eta_secs() {
            Some(secs) => format!("{}s", secs),
            None => "--".to_string(),
        };
        format!(
            "{}: {} / {} ({:.0}%, {}/s, ETA {})",
            label,
            format_bytes(self.transferred_bytes),
            format_bytes(self.total_bytes),
            self.progress_percent().floor(),
            rate,
            eta
        )
    }
}

/// Binary-unit byte count, one decimal place above 1 KiB
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for u in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = u;
    }
    format!("{:.1} {}", value, unit)
}
