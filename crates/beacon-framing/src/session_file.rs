//! Reading and writing whole `.glf` session files.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::frame::{FrameRead, FrameType, read_frame, write_frame};
use crate::types::{
    LogRecord, MetricDefinitionWire, MetricSampleRecord, Record, Severity, SessionControl,
    SessionStatus, SessionSummary,
};
use crate::{FramingError, Result};

pub const GLF_MAGIC: [u8; 4] = *b"GLF\0";
pub const GLF_VERSION: u8 = 1;
const RESERVED: [u8; 3] = [0, 0, 0];

/// Appends frames to an open `.glf` file and tracks the running summary.
pub struct SessionFileWriter {
    path: PathBuf,
    file: BufWriter<File>,
    summary: SessionSummary,
    flush_interval: Duration,
    last_flush: Instant,
}

impl SessionFileWriter {
    /// Create the file, write the magic header and the initial
    /// [`SessionSummary`] frame, and fsync the header region.
    pub fn open(path: &Path, summary: SessionSummary, flush_interval: Duration) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&GLF_MAGIC)?;
        file.write_all(&[GLF_VERSION])?;
        file.write_all(&RESERVED)?;

        let mut payload = Vec::new();
        summary.write(&mut payload)?;
        write_frame(&mut file, FrameType::SessionSummary, &payload)?;
        file.sync_all()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            summary,
            flush_interval,
            last_flush: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    /// Append a log record. Flushes immediately for `wait_for_commit`
    /// requests or severity >= Error; otherwise relies on the flush
    /// interval elapsing on a later write.
    pub fn write_log(&mut self, record: LogRecord, wait_for_commit: bool) -> Result<()> {
        if record.timestamp_ticks < self.summary.start_time_ticks {
            return Err(FramingError::TimestampBeforeSessionStart);
        }
        let severity = record.severity;
        let force = wait_for_commit || severity >= Severity::Error;
        self.write_record(Record::Log(record), force)?;
        self.summary.count_for(severity);
        Ok(())
    }

    /// Append a metric sample record.
    pub fn write_metric_sample(
        &mut self,
        record: MetricSampleRecord,
        wait_for_commit: bool,
    ) -> Result<()> {
        if record.timestamp_ticks < self.summary.start_time_ticks {
            return Err(FramingError::TimestampBeforeSessionStart);
        }
        self.write_record(Record::Metric(record), wait_for_commit)
    }

    /// Append a metric definition frame (written once, the first time a
    /// definition is seen in this process).
    pub fn write_metric_definition(&mut self, def: &MetricDefinitionWire) -> Result<()> {
        let mut payload = Vec::new();
        def.write(&mut payload)?;
        write_frame(&mut self.file, FrameType::MetricDefinition, &payload)?;
        self.maybe_flush(false)
    }

    fn write_record(&mut self, record: Record, force_flush: bool) -> Result<()> {
        let frame_type = match &record {
            Record::Log(_) => FrameType::LogMessage,
            Record::Metric(_) => FrameType::MetricSample,
            Record::Control(_) => FrameType::SessionEnd,
        };
        let mut payload = Vec::new();
        record.write_payload(&mut payload)?;
        write_frame(&mut self.file, frame_type, &payload)?;
        self.maybe_flush(force_flush)
    }

    fn maybe_flush(&mut self, force: bool) -> Result<()> {
        if force || self.last_flush.elapsed() >= self.flush_interval {
            self.file.flush()?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Write a `FileRoll` trailer carrying the current running summary, then
    /// flush and fsync. Returns the summary snapshot so the caller can open
    /// the next file in the session with an incremented file-sequence.
    pub fn roll(&mut self) -> Result<SessionSummary> {
        let snapshot = self.summary.clone();
        let mut payload = Vec::new();
        snapshot.write(&mut payload)?;
        write_frame(&mut self.file, FrameType::FileRoll, &payload)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(snapshot)
    }

    /// Write the terminal `SessionEnd` frame with the given status/reason,
    /// fsync, and consume the writer (dropping it releases any file handle
    /// and, at the repository layer, the session's exclusive lock).
    pub fn close(mut self, status: SessionStatus, reason: Option<String>) -> Result<SessionSummary> {
        self.summary.final_status = status;
        self.summary.final_reason = reason.clone();
        let control = SessionControl::EndSession { status, reason };
        self.write_record(Record::Control(control), true)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.summary)
    }
}

/// Forward-scanning reader. Stops cleanly at the first truncated or
/// malformed frame rather than erroring, per the crash-safety contract.
pub struct SessionFileReader {
    reader: BufReader<File>,
    header_summary: SessionSummary,
    truncated: bool,
}

impl SessionFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != GLF_MAGIC {
            return Err(FramingError::BadMagic(magic));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != GLF_VERSION {
            return Err(FramingError::UnsupportedVersion(version[0]));
        }
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;

        let header_summary = match read_frame(&mut reader)? {
            FrameRead::Frame {
                frame_type,
                payload,
            } if frame_type == FrameType::SessionSummary as u8 => {
                SessionSummary::read(&mut &payload[..])?
            }
            _ => {
                return Err(FramingError::MalformedPayload(
                    FrameType::SessionSummary,
                    "missing header SessionSummary frame".to_string(),
                ));
            }
        };

        Ok(Self {
            reader,
            header_summary,
            truncated: false,
        })
    }

    pub fn header_summary(&self) -> &SessionSummary {
        &self.header_summary
    }

    /// Whether the last call to [`next_raw`](Self::next_raw) stopped because
    /// of a truncated tail rather than a clean `None` at a frame boundary.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Read the next raw frame (type byte + payload bytes), or `None` at a
    /// clean boundary (EOF aligned with a frame end, or a truncated tail —
    /// check [`is_truncated`](Self::is_truncated) to tell them apart).
    pub fn next_raw(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        match read_frame(&mut self.reader)? {
            FrameRead::Frame {
                frame_type,
                payload,
            } => Ok(Some((frame_type, payload))),
            FrameRead::Eof => Ok(None),
            FrameRead::Truncated => {
                self.truncated = true;
                Ok(None)
            }
        }
    }

    /// Read and decode the next record-shaped frame, skipping
    /// `MetricDefinition` frames (exposed separately via
    /// [`next_definition`](Self::next_definition) since they aren't
    /// `Record`s) and summary/roll trailers (exposed via
    /// [`next_summary_frame`](Self::next_summary_frame)).
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some((frame_type, payload)) = self.next_raw()? else {
                return Ok(None);
            };
            let ft = FrameType::from_u8(frame_type)?;
            match ft {
                FrameType::LogMessage => {
                    return Ok(Some(Record::Log(LogRecord::read(&mut &payload[..])?)));
                }
                FrameType::MetricSample => {
                    return Ok(Some(Record::Metric(MetricSampleRecord::read(
                        &mut &payload[..],
                    )?)));
                }
                FrameType::SessionEnd => {
                    let summary = SessionSummary::read(&mut &payload[..])?;
                    return Ok(Some(Record::Control(SessionControl::EndSession {
                        status: summary.final_status,
                        reason: summary.final_reason,
                    })));
                }
                FrameType::MetricDefinition | FrameType::FileRoll => continue,
                FrameType::SessionSummary | FrameType::ExceptionInfo | FrameType::ThreadInfo => {
                    continue;
                }
            }
        }
    }

    /// Decode the next frame as a `MetricDefinition`, if that's what it is.
    pub fn next_definition(&mut self) -> Result<Option<MetricDefinitionWire>> {
        let Some((frame_type, payload)) = self.next_raw()? else {
            return Ok(None);
        };
        if FrameType::from_u8(frame_type)? != FrameType::MetricDefinition {
            return Ok(None);
        }
        Ok(Some(MetricDefinitionWire::read(&mut &payload[..])?))
    }
}

/// Reverse-scan from the end of the file for the offset of the last frame
/// whose trailing length matches its leading length — a best-effort repair
/// utility for tools operating on a file the forward reader already
/// determined has a truncated tail. Returns `None` if no valid frame
/// boundary is found within the scan window.
pub fn recover_last_valid_offset(path: &Path) -> io::Result<Option<u64>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut buf = Vec::with_capacity(len as usize);
    file.read_to_end(&mut buf)?;

    // Walk backward one byte at a time looking for a position `end` such
    // that the 4 bytes ending there encode the same length as the 4 bytes
    // starting `5 + length` bytes earlier (leading length + type byte).
    let mut end = buf.len() as u64;
    while end >= 4 {
        let trailing_len = u32::from_le_bytes(buf[(end - 4) as usize..end as usize].try_into().unwrap());
        let frame_total = 4 + 1 + trailing_len as u64 + 4;
        if frame_total <= end {
            let start = end - frame_total;
            let leading_len =
                u32::from_le_bytes(buf[start as usize..start as usize + 4].try_into().unwrap());
            if leading_len == trailing_len {
                return Ok(Some(end));
            }
        }
        end -= 1;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_summary() -> SessionSummary {
        SessionSummary {
            session_id: 1,
            file_id: 1,
            file_sequence: 0,
            product: "acme".into(),
            application: "widget".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            cpu_count: 4,
            memory_bytes: 16_000_000_000,
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

    fn sample_log(seq: u64, ts: i64, severity: Severity) -> LogRecord {
        LogRecord {
            sequence: seq,
            severity,
            category: "cat".into(),
            timestamp_ticks: ts,
            thread_id: 1,
            source: Default::default(),
            caption: "hello".into(),
            description: "desc".into(),
            details: None,
            exception: None,
            principal: None,
        }
    }

    #[test]
    fn write_then_read_reproduces_records() {
        let td = tempdir().unwrap();
        let path = td.path().join("0.glf");

        let mut writer =
            SessionFileWriter::open(&path, sample_summary(), Duration::from_secs(5)).unwrap();
        writer
            .write_log(sample_log(1, 10, Severity::Information), false)
            .unwrap();
        writer
            .write_log(sample_log(2, 20, Severity::Warning), false)
            .unwrap();
        writer.close(SessionStatus::Normal, Some("bye".into())).unwrap();

        let mut reader = SessionFileReader::open(&path).unwrap();
        assert_eq!(reader.header_summary().session_id, 1);

        let first = reader.next_record().unwrap().unwrap();
        assert!(matches!(first, Record::Log(ref r) if r.sequence == 1));
        let second = reader.next_record().unwrap().unwrap();
        assert!(matches!(second, Record::Log(ref r) if r.sequence == 2));
        let third = reader.next_record().unwrap().unwrap();
        assert!(matches!(
            third,
            Record::Control(SessionControl::EndSession { status: SessionStatus::Normal, .. })
        ));
        assert!(reader.next_record().unwrap().is_none());
        assert!(!reader.is_truncated());
    }

    #[test]
    fn rejects_record_before_session_start() {
        let td = tempdir().unwrap();
        let path = td.path().join("0.glf");
        let mut summary = sample_summary();
        summary.start_time_ticks = 1000;
        let mut writer = SessionFileWriter::open(&path, summary, Duration::from_secs(5)).unwrap();

        let result = writer.write_log(sample_log(1, 5, Severity::Information), false);
        assert!(matches!(
            result,
            Err(FramingError::TimestampBeforeSessionStart)
        ));
    }

    #[test]
    fn truncated_tail_stops_cleanly_and_is_flagged() {
        let td = tempdir().unwrap();
        let path = td.path().join("0.glf");

        let mut writer =
            SessionFileWriter::open(&path, sample_summary(), Duration::from_secs(5)).unwrap();
        writer
            .write_log(sample_log(1, 10, Severity::Information), true)
            .unwrap();
        writer
            .write_log(sample_log(2, 20, Severity::Information), true)
            .unwrap();

        // Simulate a crash mid-write: chop the last few bytes off the file.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 5]).unwrap();

        let mut reader = SessionFileReader::open(&path).unwrap();
        let first = reader.next_record().unwrap();
        assert!(first.is_some());
        let second = reader.next_record().unwrap();
        assert!(second.is_none());
        assert!(reader.is_truncated());
    }

    #[test]
    fn roll_writes_file_roll_trailer_and_keeps_file_usable() {
        let td = tempdir().unwrap();
        let path = td.path().join("0.glf");
        let mut writer =
            SessionFileWriter::open(&path, sample_summary(), Duration::from_secs(5)).unwrap();
        writer
            .write_log(sample_log(1, 10, Severity::Information), false)
            .unwrap();
        let snapshot = writer.roll().unwrap();
        assert_eq!(snapshot.information_count, 1);
    }
}
