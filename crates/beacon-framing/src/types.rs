//! Record and summary types that get framed onto a session file.
//!
//! These are value types: no back-references to a session or messenger
//! object (per the flattening design note — cyclic graphs in the source
//! system become plain fields plus an opaque session-id).

use std::io::{self, Read, Write};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::wire::*;

/// Ticks are signed 100ns units since `0001-01-01T00:00:00Z`, matching the
/// wire format's timestamp representation exactly.
const TICKS_PER_SECOND: i64 = 10_000_000;

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
}

pub fn to_ticks(dt: DateTime<Utc>) -> i64 {
    let delta = dt - epoch();
    delta.num_seconds() * TICKS_PER_SECOND
        + (delta.subsec_nanos() as i64).div_euclid(100) % TICKS_PER_SECOND
}

pub fn from_ticks(ticks: i64) -> DateTime<Utc> {
    let seconds = ticks.div_euclid(TICKS_PER_SECOND);
    let remainder_ticks = ticks.rem_euclid(TICKS_PER_SECOND);
    epoch() + chrono::Duration::seconds(seconds) + chrono::Duration::nanoseconds(remainder_ticks * 100)
}

/// Severity levels. Numeric values are preserved bit-exact on the wire per
/// the open question about aliased severity/task-result flags — do not
/// renumber these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Verbose = 0,
    Information = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl Severity {
    pub fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(Severity::Verbose),
            1 => Ok(Severity::Information),
            2 => Ok(Severity::Warning),
            3 => Ok(Severity::Error),
            4 => Ok(Severity::Critical),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown severity value {other}"),
            )),
        }
    }
}

/// Typed replacement for the source's dynamic `object[]` argument arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Timestamp(i64),
    Duration(i64),
    EnumValue(i64),
}

impl Scalar {
    fn tag(&self) -> u8 {
        match self {
            Scalar::I64(_) => 0,
            Scalar::U64(_) => 1,
            Scalar::F64(_) => 2,
            Scalar::Bool(_) => 3,
            Scalar::Str(_) => 4,
            Scalar::Timestamp(_) => 5,
            Scalar::Duration(_) => 6,
            Scalar::EnumValue(_) => 7,
        }
    }

    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u8(w, self.tag())?;
        match self {
            Scalar::I64(v) | Scalar::Timestamp(v) | Scalar::Duration(v) | Scalar::EnumValue(v) => {
                write_i64(w, *v)
            }
            Scalar::U64(v) => write_u64(w, *v),
            Scalar::F64(v) => write_f64(w, *v),
            Scalar::Bool(v) => write_bool(w, *v),
            Scalar::Str(v) => write_string(w, v),
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let tag = read_u8(r)?;
        Ok(match tag {
            0 => Scalar::I64(read_i64(r)?),
            1 => Scalar::U64(read_u64(r)?),
            2 => Scalar::F64(read_f64(r)?),
            3 => Scalar::Bool(read_bool(r)?),
            4 => Scalar::Str(read_string(r)?),
            5 => Scalar::Timestamp(read_i64(r)?),
            6 => Scalar::Duration(read_i64(r)?),
            7 => Scalar::EnumValue(read_i64(r)?),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown scalar tag {other}"),
                ));
            }
        })
    }
}

fn write_scalar_pairs<W: Write>(w: &mut W, pairs: &[(String, Scalar)]) -> io::Result<()> {
    write_u32(w, pairs.len() as u32)?;
    for (name, value) in pairs {
        write_string(w, name)?;
        value.write(w)?;
    }
    Ok(())
}

fn read_scalar_pairs<R: Read>(r: &mut R) -> io::Result<Vec<(String, Scalar)>> {
    let count = read_u32(r)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_string(r)?;
        let value = Scalar::read(r)?;
        out.push((name, value));
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub class: Option<String>,
    pub method: Option<String>,
    pub line: Option<u32>,
}

impl SourceLocation {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_opt_string(w, &self.file)?;
        write_opt_string(w, &self.class)?;
        write_opt_string(w, &self.method)?;
        match self.line {
            Some(l) => {
                write_bool(w, true)?;
                write_u32(w, l)
            }
            None => write_bool(w, false),
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let file = read_opt_string(r)?;
        let class = read_opt_string(r)?;
        let method = read_opt_string(r)?;
        let line = if read_bool(r)? {
            Some(read_u32(r)?)
        } else {
            None
        };
        Ok(Self {
            file,
            class,
            method,
            line,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub message: String,
    pub type_name: String,
    pub stack: String,
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.message)?;
        write_string(w, &self.type_name)?;
        write_string(w, &self.stack)?;
        match &self.inner {
            Some(inner) => {
                write_bool(w, true)?;
                inner.write(w)
            }
            None => write_bool(w, false),
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let message = read_string(r)?;
        let type_name = read_string(r)?;
        let stack = read_string(r)?;
        let inner = if read_bool(r)? {
            Some(Box::new(ExceptionInfo::read(r)?))
        } else {
            None
        };
        Ok(Self {
            message,
            type_name,
            stack,
            inner,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sequence: u64,
    pub severity: Severity,
    pub category: String,
    pub timestamp_ticks: i64,
    pub thread_id: u64,
    pub source: SourceLocation,
    pub caption: String,
    pub description: String,
    pub details: Option<String>,
    pub exception: Option<ExceptionInfo>,
    pub principal: Option<String>,
}

impl LogRecord {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u64(w, self.sequence)?;
        write_u8(w, self.severity as u8)?;
        write_string(w, &self.category)?;
        write_i64(w, self.timestamp_ticks)?;
        write_u64(w, self.thread_id)?;
        self.source.write(w)?;
        write_string(w, &self.caption)?;
        write_string(w, &self.description)?;
        write_opt_string(w, &self.details)?;
        match &self.exception {
            Some(e) => {
                write_bool(w, true)?;
                e.write(w)?;
            }
            None => write_bool(w, false)?,
        }
        write_opt_string(w, &self.principal)?;
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let sequence = read_u64(r)?;
        let severity = Severity::from_u8(read_u8(r)?)?;
        let category = read_string(r)?;
        let timestamp_ticks = read_i64(r)?;
        let thread_id = read_u64(r)?;
        let source = SourceLocation::read(r)?;
        let caption = read_string(r)?;
        let description = read_string(r)?;
        let details = read_opt_string(r)?;
        let exception = if read_bool(r)? {
            Some(ExceptionInfo::read(r)?)
        } else {
            None
        };
        let principal = read_opt_string(r)?;
        Ok(Self {
            sequence,
            severity,
            category,
            timestamp_ticks,
            thread_id,
            source,
            caption,
            description,
            details,
            exception,
            principal,
        })
    }
}

/// Scalar type + role schema entry for an `Event`-shaped metric definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SummarizationRole {
    Trend = 0,
    Sum = 1,
    RunningAverage = 2,
    RunningSum = 3,
    Identity = 4,
}

impl SummarizationRole {
    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(Self::Trend),
            1 => Ok(Self::Sum),
            2 => Ok(Self::RunningAverage),
            3 => Ok(Self::RunningSum),
            4 => Ok(Self::Identity),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown summarization role {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchemaField {
    pub name: String,
    pub role: SummarizationRole,
    pub caption: String,
}

/// Wire-shape of a `MetricDefinition` (frame type 0x03). Identity is the
/// (system, category, counter) triple named in the data model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinitionWire {
    pub system: String,
    pub category: String,
    pub counter: String,
    pub is_event: bool,
    pub event_schema: Vec<EventSchemaField>,
    pub sampled_role: Option<SummarizationRole>,
}

impl MetricDefinitionWire {
    pub(crate) fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_string(w, &self.system)?;
        write_string(w, &self.category)?;
        write_string(w, &self.counter)?;
        write_bool(w, self.is_event)?;
        write_u32(w, self.event_schema.len() as u32)?;
        for field in &self.event_schema {
            write_string(w, &field.name)?;
            write_u8(w, field.role as u8)?;
            write_string(w, &field.caption)?;
        }
        match self.sampled_role {
            Some(role) => {
                write_bool(w, true)?;
                write_u8(w, role as u8)?;
            }
            None => write_bool(w, false)?,
        }
        Ok(())
    }

    pub(crate) fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let system = read_string(r)?;
        let category = read_string(r)?;
        let counter = read_string(r)?;
        let is_event = read_bool(r)?;
        let field_count = read_u32(r)? as usize;
        let mut event_schema = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let name = read_string(r)?;
            let role = SummarizationRole::from_u8(read_u8(r)?)?;
            let caption = read_string(r)?;
            event_schema.push(EventSchemaField {
                name,
                role,
                caption,
            });
        }
        let sampled_role = if read_bool(r)? {
            Some(SummarizationRole::from_u8(read_u8(r)?)?)
        } else {
            None
        };
        Ok(Self {
            system,
            category,
            counter,
            is_event,
            event_schema,
            sampled_role,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricSampleKind {
    Event(Vec<(String, Scalar)>),
    Counter(f64),
    Sampled(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSampleRecord {
    pub sequence: u64,
    pub system: String,
    pub category: String,
    pub counter: String,
    pub instance_name: Option<String>,
    pub timestamp_ticks: i64,
    pub kind: MetricSampleKind,
}

impl MetricSampleRecord {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u64(w, self.sequence)?;
        write_string(w, &self.system)?;
        write_string(w, &self.category)?;
        write_string(w, &self.counter)?;
        write_opt_string(w, &self.instance_name)?;
        write_i64(w, self.timestamp_ticks)?;
        match &self.kind {
            MetricSampleKind::Event(pairs) => {
                write_u8(w, 0)?;
                write_scalar_pairs(w, pairs)?;
            }
            MetricSampleKind::Counter(v) => {
                write_u8(w, 1)?;
                write_f64(w, *v)?;
            }
            MetricSampleKind::Sampled(v) => {
                write_u8(w, 2)?;
                write_f64(w, *v)?;
            }
        }
        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let sequence = read_u64(r)?;
        let system = read_string(r)?;
        let category = read_string(r)?;
        let counter = read_string(r)?;
        let instance_name = read_opt_string(r)?;
        let timestamp_ticks = read_i64(r)?;
        let kind_tag = read_u8(r)?;
        let kind = match kind_tag {
            0 => MetricSampleKind::Event(read_scalar_pairs(r)?),
            1 => MetricSampleKind::Counter(read_f64(r)?),
            2 => MetricSampleKind::Sampled(read_f64(r)?),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown metric sample kind {other}"),
                ));
            }
        };
        Ok(Self {
            sequence,
            system,
            category,
            counter,
            instance_name,
            timestamp_ticks,
            kind,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionStatus {
    Running = 0,
    Normal = 1,
    Crashed = 2,
    Unknown = 3,
}

impl SessionStatus {
    fn from_u8(v: u8) -> io::Result<Self> {
        match v {
            0 => Ok(Self::Running),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Crashed),
            3 => Ok(Self::Unknown),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown session status {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionControl {
    StartSession,
    EndFile,
    EndSession {
        status: SessionStatus,
        reason: Option<String>,
    },
}

impl SessionControl {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            SessionControl::StartSession => write_u8(w, 0),
            SessionControl::EndFile => write_u8(w, 1),
            SessionControl::EndSession { status, reason } => {
                write_u8(w, 2)?;
                write_u8(w, *status as u8)?;
                write_opt_string(w, reason)
            }
        }
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        match read_u8(r)? {
            0 => Ok(SessionControl::StartSession),
            1 => Ok(SessionControl::EndFile),
            2 => {
                let status = SessionStatus::from_u8(read_u8(r)?)?;
                let reason = read_opt_string(r)?;
                Ok(SessionControl::EndSession { status, reason })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown session control tag {other}"),
            )),
        }
    }
}

/// One of the three record variants a producer may submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Log(LogRecord),
    Metric(MetricSampleRecord),
    Control(SessionControl),
}

impl Record {
    pub(crate) fn write_payload<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Record::Log(rec) => rec.write(w),
            Record::Metric(rec) => rec.write(w),
            Record::Control(rec) => rec.write(w),
        }
    }
}

/// Host-environment fingerprint plus running counters, written as the
/// file's first frame and periodically re-flushed as a trailer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: u128,
    pub file_id: u128,
    pub file_sequence: u32,
    pub product: String,
    pub application: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub pid: u32,
    pub hostname: String,
    pub principal: Option<String>,
    pub start_time_ticks: i64,

    pub total_messages: u64,
    pub verbose_count: u64,
    pub information_count: u64,
    pub warning_count: u64,
    pub error_count: u64,
    pub critical_count: u64,
    pub end_time_or_heartbeat_ticks: i64,
    pub final_status: SessionStatus,
    pub final_reason: Option<String>,
}

impl SessionSummary {
    pub fn count_for(&mut self, severity: Severity) {
        self.total_messages += 1;
        match severity {
            Severity::Verbose => self.verbose_count += 1,
            Severity::Information => self.information_count += 1,
            Severity::Warning => self.warning_count += 1,
            Severity::Error => self.error_count += 1,
            Severity::Critical => self.critical_count += 1,
        }
    }

    pub(crate) fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u64(w, (self.session_id >> 64) as u64)?;
        write_u64(w, self.session_id as u64)?;
        write_u64(w, (self.file_id >> 64) as u64)?;
        write_u64(w, self.file_id as u64)?;
        write_u32(w, self.file_sequence)?;
        write_string(w, &self.product)?;
        write_string(w, &self.application)?;
        write_string(w, &self.version)?;
        write_string(w, &self.os)?;
        write_string(w, &self.arch)?;
        write_u32(w, self.cpu_count)?;
        write_u64(w, self.memory_bytes)?;
        write_u32(w, self.pid)?;
        write_string(w, &self.hostname)?;
        write_opt_string(w, &self.principal)?;
        write_i64(w, self.start_time_ticks)?;
        write_u64(w, self.total_messages)?;
        write_u64(w, self.verbose_count)?;
        write_u64(w, self.information_count)?;
        write_u64(w, self.warning_count)?;
        write_u64(w, self.error_count)?;
        write_u64(w, self.critical_count)?;
        write_i64(w, self.end_time_or_heartbeat_ticks)?;
        write_u8(w, self.final_status as u8)?;
        write_opt_string(w, &self.final_reason)?;
        Ok(())
    }

    pub(crate) fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        let session_hi = read_u64(r)? as u128;
        let session_lo = read_u64(r)? as u128;
        let session_id = (session_hi << 64) | session_lo;
        let file_hi = read_u64(r)? as u128;
        let file_lo = read_u64(r)? as u128;
        let file_id = (file_hi << 64) | file_lo;
        let file_sequence = read_u32(r)?;
        let product = read_string(r)?;
        let application = read_string(r)?;
        let version = read_string(r)?;
        let os = read_string(r)?;
        let arch = read_string(r)?;
        let cpu_count = read_u32(r)?;
        let memory_bytes = read_u64(r)?;
        let pid = read_u32(r)?;
        let hostname = read_string(r)?;
        let principal = read_opt_string(r)?;
        let start_time_ticks = read_i64(r)?;
        let total_messages = read_u64(r)?;
        let verbose_count = read_u64(r)?;
        let information_count = read_u64(r)?;
        let warning_count = read_u64(r)?;
        let error_count = read_u64(r)?;
        let critical_count = read_u64(r)?;
        let end_time_or_heartbeat_ticks = read_i64(r)?;
        let final_status = SessionStatus::from_u8(read_u8(r)?)?;
        let final_reason = read_opt_string(r)?;
        Ok(Self {
            session_id,
            file_id,
            file_sequence,
            product,
            application,
            version,
            os,
            arch,
            cpu_count,
            memory_bytes,
            pid,
            hostname,
            principal,
            start_time_ticks,
            total_messages,
            verbose_count,
            information_count,
            warning_count,
            error_count,
            critical_count,
            end_time_or_heartbeat_ticks,
            final_status,
            final_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_round_trip() {
        let now = Utc::now();
        let ticks = to_ticks(now);
        let back = from_ticks(ticks);
        // Ticks have 100ns resolution; chrono's Utc::now() is sub-microsecond,
        // so allow for truncation but not more than one tick's worth of drift.
        assert!((back - now).num_milliseconds().abs() <= 1);
    }

    #[test]
    fn severity_ordering_is_numeric() {
        assert!(Severity::Verbose < Severity::Information);
        assert!(Severity::Error < Severity::Critical);
        assert_eq!(Severity::Warning as u8, 2);
    }

    #[test]
    fn scalar_round_trips_through_event_pairs() {
        let pairs = vec![
            ("count".to_string(), Scalar::U64(7)),
            ("name".to_string(), Scalar::Str("widget".to_string())),
        ];
        let mut buf = Vec::new();
        write_scalar_pairs(&mut buf, &pairs).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_scalar_pairs(&mut cursor).unwrap();
        assert_eq!(decoded, pairs);
    }
}
