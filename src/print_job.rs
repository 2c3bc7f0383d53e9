// src/print_job.rs - bookkeeping for the file currently selected or being printed
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStatus {
    Selected,
    Printing,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl PrintStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, PrintStatus::Completed | PrintStatus::Cancelled | PrintStatus::Error)
    }
}

#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: Uuid,
    pub file_path: String,
    pub status: PrintStatus,
    pub selected_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Fraction of the file consumed, 0.0 ..= 1.0
    pub progress: f64,
}

impl PrintJob {
    pub fn new(file_path: &str) -> Self {
        PrintJob {
            id: Uuid::new_v4(),
            file_path: file_path.to_string(),
            status: PrintStatus::Selected,
            selected_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: 0.0,
        }
    }

    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
            tracing::info!(job = %self.id, file = %self.file_path, "print started");
        } else {
            tracing::info!(job = %self.id, "print resumed");
        }
        self.status = PrintStatus::Printing;
    }

    pub fn pause(&mut self) {
        if self.status == PrintStatus::Printing {
            self.status = PrintStatus::Paused;
            tracing::info!(job = %self.id, progress = self.progress, "print paused");
        }
    }

    pub fn finish(&mut self, status: PrintStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        if status == PrintStatus::Completed {
            self.progress = 1.0;
        }
        let elapsed = self
            .started_at
            .and_then(|s| self.finished_at.map(|f| (f - s).num_milliseconds()))
            .unwrap_or(0);
        tracing::info!(job = %self.id, ?status, elapsed_ms = elapsed, "print finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let mut job = PrintJob::new("gcodes/part.g");
        assert_eq!(job.status, PrintStatus::Selected);
        job.start();
        assert!(job.started_at.is_some());
        job.pause();
        assert_eq!(job.status, PrintStatus::Paused);
        job.start();
        assert_eq!(job.status, PrintStatus::Printing);
        job.finish(PrintStatus::Completed);
        assert!(job.status.is_finished());
        assert_eq!(job.progress, 1.0);
    }
}
