//! Session File Messenger: durable, append-only, frame-delimited record of
//! the publisher's output stream.
//!
//! Wraps [`beacon_framing::SessionFileWriter`] with roll-over policy
//! (size/age/record-count triggers), retry-with-backoff on write failure,
//! and degraded-state handling so a failing sink never blocks the
//! publisher.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use beacon_framing::{
    LogRecord, MetricDefinitionWire, MetricSampleRecord, SessionFileWriter, SessionStatus,
    SessionSummary,
};
use beacon_retry::{RetryExecutor, RetryStrategyConfig, RetryStrategyType};

/// Any of these crossing their threshold triggers a `roll()`.
#[derive(Debug, Clone)]
pub struct RollPolicy {
    pub max_file_bytes: u64,
    pub max_file_age: Duration,
    pub max_records_per_file: u64,
}

impl Default for RollPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: 20 * 1024 * 1024,
            max_file_age: Duration::from_secs(24 * 60 * 60),
            max_records_per_file: 100_000,
        }
    }
}

fn write_retry_config() -> RetryStrategyConfig {
    RetryStrategyConfig {
        strategy: RetryStrategyType::Exponential,
        max_attempts: 6, // exponential from ~1s caps out near the 30s write-failure budget.
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
        jitter: 0.2,
    }
}

fn new_id() -> u128 {
    rand::random::<u128>()
}

/// Durable, rolling, frame-delimited writer for one session's files.
pub struct SessionFileMessenger {
    session_dir: PathBuf,
    policy: RollPolicy,
    flush_interval: Duration,
    writer: Option<SessionFileWriter>,
    opened_at: Instant,
    records_in_file: u64,
    degraded: bool,
    degraded_write_count: u64,
}

impl SessionFileMessenger {
    /// Open the first file (sequence 0) of a new session under
    /// `session_dir`, deriving the header summary from the host
    /// fingerprint and identity fields.
    pub fn open(
        session_dir: &Path,
        mut summary: SessionSummary,
        policy: RollPolicy,
        flush_interval: Duration,
    ) -> io::Result<Self> {
        fs::create_dir_all(session_dir)?;
        if summary.session_id == 0 {
            summary.session_id = new_id();
        }
        if summary.file_id == 0 {
            summary.file_id = new_id();
        }
        let path = file_path(session_dir, summary.file_sequence);
        let writer = SessionFileWriter::open(&path, summary, flush_interval)
            .map_err(|e| io::Error::other(e.to_string()))?;

        Ok(Self {
            session_dir: session_dir.to_path_buf(),
            policy,
            flush_interval,
            writer: Some(writer),
            opened_at: Instant::now(),
            records_in_file: 0,
            degraded: false,
            degraded_write_count: 0,
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn degraded_write_count(&self) -> u64 {
        self.degraded_write_count
    }

    pub fn write_log(&mut self, record: LogRecord, wait_for_commit: bool) -> io::Result<()> {
        if self.degraded {
            self.degraded_write_count += 1;
            return Ok(());
        }
        self.maybe_roll()?;
        let result = self.retry_write(|writer| writer.write_log(record.clone(), wait_for_commit));
        if result.is_ok() {
            self.records_in_file += 1;
        }
        result
    }

    pub fn write_metric_sample(
        &mut self,
        record: MetricSampleRecord,
        wait_for_commit: bool,
    ) -> io::Result<()> {
        if self.degraded {
            self.degraded_write_count += 1;
            return Ok(());
        }
        self.maybe_roll()?;
        let result =
            self.retry_write(|writer| writer.write_metric_sample(record.clone(), wait_for_commit));
        if result.is_ok() {
            self.records_in_file += 1;
        }
        result
    }

    pub fn write_metric_definition(&mut self, def: &MetricDefinitionWire) -> io::Result<()> {
        if self.degraded {
            self.degraded_write_count += 1;
            return Ok(());
        }
        self.retry_write(|writer| writer.write_metric_definition(def))
    }

    /// Explicit `end_file()`: always rolls regardless of the size/age/count
    /// policy thresholds.
    pub fn end_file(&mut self) -> io::Result<()> {
        self.roll()
    }

    pub fn close(mut self, status: SessionStatus, reason: Option<String>) -> io::Result<SessionSummary> {
        let writer = self
            .writer
            .take()
            .expect("writer is only taken by close/roll, which consume self or replace it");
        writer
            .close(status, reason)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn maybe_roll(&mut self) -> io::Result<()> {
        let needs_roll = {
            let writer = self.writer.as_ref().unwrap();
            let approx_bytes = self.current_file_len(writer.path())?;
            approx_bytes >= self.policy.max_file_bytes
                || self.opened_at.elapsed() >= self.policy.max_file_age
                || self.records_in_file >= self.policy.max_records_per_file
        };
        if needs_roll {
            self.roll()?;
        }
        Ok(())
    }

    fn current_file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path).map(|m| m.len()).unwrap_or(0))
    }

    fn roll(&mut self) -> io::Result<()> {
        let writer = self.writer.as_mut().unwrap();
        let snapshot = writer
            .roll()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let mut next_summary = snapshot;
        next_summary.file_id = new_id();
        next_summary.file_sequence += 1;
        next_summary.total_messages = 0;
        next_summary.verbose_count = 0;
        next_summary.information_count = 0;
        next_summary.warning_count = 0;
        next_summary.error_count = 0;
        next_summary.critical_count = 0;
        next_summary.final_status = SessionStatus::Running;
        next_summary.final_reason = None;

        let path = file_path(&self.session_dir, next_summary.file_sequence);
        let new_writer = SessionFileWriter::open(&path, next_summary, self.flush_interval)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.writer = Some(new_writer);
        self.opened_at = Instant::now();
        self.records_in_file = 0;
        Ok(())
    }

    /// Retry a fallible write for up to 30s of capped exponential backoff;
    /// on persistent failure, enter the degraded state. A degraded
    /// messenger silently discards further writes and never blocks the
    /// publisher.
    fn retry_write<F>(&mut self, mut op: F) -> io::Result<()>
    where
        F: FnMut(&mut SessionFileWriter) -> beacon_framing::Result<()>,
    {
        let executor = RetryExecutor::new(write_retry_config());
        let writer = self.writer.as_mut().unwrap();
        let result = executor.run(|_attempt| op(writer));
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("session file messenger entering degraded state: {e}");
                self.degraded = true;
                self.degraded_write_count += 1;
                Ok(())
            }
        }
    }
}

fn file_path(session_dir: &Path, file_sequence: u32) -> PathBuf {
    session_dir.join(format!("{file_sequence}.glf"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_framing::Severity;
    use tempfile::tempdir;

    fn sample_summary() -> SessionSummary {
        SessionSummary {
            session_id: 0,
            file_id: 0,
            file_sequence: 0,
            product: "acme".into(),
            application: "widget".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            cpu_count: 4,
            memory_bytes: 0,
            pid: std::process::id(),
            hostname: "host".into(),
            principal: None,
            start_time_ticks: 0,
            total_messages: 0,
            verbose_count: 0,
            information_count: 0,
            warning_count: 0,
            error_count: 0,
            critical_count: 0,
            end_time_or_heartbeat_ticks: 0,
            final_status: SessionStatus::Running,
            final_reason: None,
        }
    }

    fn sample_log(seq: u64) -> LogRecord {
        LogRecord {
            sequence: seq,
            severity: Severity::Information,
            category: "cat".into(),
            timestamp_ticks: seq as i64,
            thread_id: 1,
            source: Default::default(),
            caption: "hi".into(),
            description: "desc".into(),
            details: None,
            exception: None,
            principal: None,
        }
    }

    #[test]
    fn opens_assigns_session_and_file_ids() {
        let td = tempdir().unwrap();
        let messenger = SessionFileMessenger::open(
            td.path(),
            sample_summary(),
            RollPolicy::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_ne!(messenger.writer.as_ref().unwrap().summary().session_id, 0);
        assert!(td.path().join("0.glf").exists());
    }

    #[test]
    fn rolls_by_explicit_end_file_and_increments_sequence() {
        let td = tempdir().unwrap();
        let mut messenger = SessionFileMessenger::open(
            td.path(),
            sample_summary(),
            RollPolicy::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        messenger.write_log(sample_log(1), false).unwrap();
        messenger.end_file().unwrap();
        assert!(td.path().join("1.glf").exists());
        assert_eq!(messenger.writer.as_ref().unwrap().summary().file_sequence, 1);
    }

    #[test]
    fn rolls_when_record_count_threshold_is_reached() {
        let td = tempdir().unwrap();
        let mut policy = RollPolicy::default();
        policy.max_records_per_file = 2;
        let mut messenger =
            SessionFileMessenger::open(td.path(), sample_summary(), policy, Duration::from_secs(5))
                .unwrap();
        messenger.write_log(sample_log(1), false).unwrap();
        messenger.write_log(sample_log(2), false).unwrap();
        // The third write observes records_in_file >= 2 and rolls first.
        messenger.write_log(sample_log(3), false).unwrap();
        assert!(td.path().join("1.glf").exists());
    }
}
