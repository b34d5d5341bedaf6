//! Local Repository: an indexed, single-writer-per-session directory of
//! closed session files.
//!
//! Directory layout: `<root>/<product>/<application>/<session-id>/<file-seq>.glf`,
//! with product/application path segments sanitized. Each session directory
//! is protected by a `beacon-lock` lock file; only a writer adding files or
//! mutating metadata takes it, readers (the upload scan) never do. The
//! product/application-level index is persisted as an `index.json` sidecar
//! next to the session directories, written atomically and rebuilt from
//! directory contents if it goes missing or fails to parse.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use beacon_framing::{SessionFileReader, SessionStatus, SessionSummary};
use beacon_lock::LockFile;
use serde::{Deserialize, Serialize};

const INDEX_FILE: &str = "index.json";

/// Replace directory separators, control characters, and other characters
/// that are awkward or reserved in file names with `_`; lowercase the
/// result so two differently-cased callers land in the same directory.
pub fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .to_lowercase()
}

/// One session's indexed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedSession {
    pub session_id: u128,
    pub dir: PathBuf,
    pub summary: SessionSummary,
    pub sent: bool,
    pub bytes_on_disk: u64,
}

/// Selects which indexed sessions [`Repository::find`] yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCriteria {
    All,
    New,
    Critical,
    Error,
    Warning,
    NewSessions,
    ActiveSession,
    CompletedSessions,
}

impl SessionCriteria {
    fn matches(self, session: &IndexedSession) -> bool {
        match self {
            SessionCriteria::All => true,
            SessionCriteria::New | SessionCriteria::NewSessions => !session.sent,
            SessionCriteria::Critical => session.summary.critical_count > 0,
            SessionCriteria::Error => session.summary.error_count > 0,
            SessionCriteria::Warning => session.summary.warning_count > 0,
            SessionCriteria::ActiveSession => session.summary.final_status == SessionStatus::Running,
            SessionCriteria::CompletedSessions => session.summary.final_status != SessionStatus::Running,
        }
    }
}

/// Either an enumerated criteria mask or a caller-supplied predicate.
pub enum Query<'a> {
    Criteria(SessionCriteria),
    Predicate(Box<dyn Fn(&IndexedSession) -> bool + 'a>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    sessions: BTreeMap<u128, IndexedSession>,
}

/// Owns one product/application directory's index and session files.
pub struct Repository {
    root: PathBuf,
    product: String,
    application: String,
    index: IndexFile,
}

impl Repository {
    /// Open (and if necessary create) the repository rooted at
    /// `root/<sanitized product>/<sanitized application>`, loading its
    /// index sidecar or rebuilding it from directory contents.
    pub fn open(root: &Path, product: &str, application: &str) -> Result<Self> {
        let dir = root
            .join(sanitize_segment(product))
            .join(sanitize_segment(application));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create repository dir {}", dir.display()))?;

        let index = Self::load_or_rebuild_index(&dir)?;

        Ok(Self {
            root: dir,
            product: product.to_string(),
            application: application.to_string(),
            index,
        })
    }

    fn load_or_rebuild_index(dir: &Path) -> Result<IndexFile> {
        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            match fs::read_to_string(&index_path)
                .ok()
                .and_then(|s| serde_json::from_str::<IndexFile>(&s).ok())
            {
                Some(index) => return Ok(index),
                None => log::warn!(
                    "repository index at {} is missing or corrupt, rebuilding from disk",
                    index_path.display()
                ),
            }
        }
        Self::rebuild_index(dir)
    }

    /// Scan session directories under `dir` and reconstruct the index from
    /// the final (highest-sequence) `.glf` file's header in each.
    fn rebuild_index(dir: &Path) -> Result<IndexFile> {
        let mut index = IndexFile::default();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(index),
        };

        for entry in entries.flatten() {
            let session_dir = entry.path();
            if !session_dir.is_dir() {
                continue;
            }
            let Some(summary) = Self::latest_summary_in(&session_dir) else {
                continue;
            };
            let bytes_on_disk = dir_size(&session_dir).unwrap_or(0);
            let sent = session_dir.join(".sent").exists();
            index.sessions.insert(
                summary.session_id,
                IndexedSession {
                    session_id: summary.session_id,
                    dir: session_dir,
                    summary,
                    sent,
                    bytes_on_disk,
                },
            );
        }
        Ok(index)
    }

    fn latest_summary_in(session_dir: &Path) -> Option<SessionSummary> {
        let mut best: Option<(u32, SessionSummary)> = None;
        for entry in fs::read_dir(session_dir).ok()?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("glf") {
                continue;
            }
            let reader = SessionFileReader::open(&path).ok()?;
            let summary = reader.header_summary().clone();
            if best
                .as_ref()
                .map(|(seq, _)| summary.file_sequence > *seq)
                .unwrap_or(true)
            {
                best = Some((summary.file_sequence, summary));
            }
        }
        best.map(|(_, s)| s)
    }

    /// Validate the magic header and session summary of an already-closed
    /// `.glf` file and move it into its canonical path, taking the
    /// session's write lock for the duration.
    pub fn add_session(&mut self, incoming_path: &Path) -> Result<u128> {
        let reader = SessionFileReader::open(incoming_path)
            .with_context(|| format!("failed to validate incoming session file {}", incoming_path.display()))?;
        let summary = reader.header_summary().clone();
        drop(reader);

        let session_dir = self.root.join(summary.session_id.to_string());
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create session dir {}", session_dir.display()))?;

        let _lock = LockFile::acquire_with_timeout(&session_dir, std::time::Duration::from_secs(30))
            .context("failed to acquire session write lock")?;

        let dest = session_dir.join(format!("{}.glf", summary.file_sequence));
        fs::rename(incoming_path, &dest)
            .with_context(|| format!("failed to move session file into {}", dest.display()))?;

        let bytes_on_disk = dir_size(&session_dir).unwrap_or(0);
        let session_id = summary.session_id;
        self.index.sessions.insert(
            session_id,
            IndexedSession {
                session_id,
                dir: session_dir,
                summary,
                sent: false,
                bytes_on_disk,
            },
        );
        self.persist_index()?;
        Ok(session_id)
    }

    /// A lazy, finite, restartable iterator over indexed sessions matching
    /// `query`. Restartable in the sense that it is a plain `Vec`-backed
    /// iterator over a point-in-time snapshot, not a live cursor.
    pub fn find(&self, query: Query<'_>) -> impl Iterator<Item = &IndexedSession> {
        self.index.sessions.values().filter(move |s| match &query {
            Query::Criteria(criteria) => criteria.matches(s),
            Query::Predicate(predicate) => predicate(s),
        })
    }

    pub fn mark_sent(&mut self, session_id: u128) -> Result<()> {
        let session_dir = self
            .index
            .sessions
            .get(&session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?
            .dir
            .clone();
        let _lock = LockFile::acquire_with_timeout(&session_dir, std::time::Duration::from_secs(30))
            .context("failed to acquire session write lock")?;

        let session = self
            .index
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?;
        session.sent = true;
        let marker = session.dir.join(".sent");
        File::create(&marker)
            .with_context(|| format!("failed to create sent marker {}", marker.display()))?;
        self.persist_index()
    }

    pub fn purge(&mut self, session_id: u128) -> Result<()> {
        let session_dir = self
            .index
            .sessions
            .get(&session_id)
            .ok_or_else(|| anyhow::anyhow!("unknown session {session_id}"))?
            .dir
            .clone();
        let _lock = LockFile::acquire_with_timeout(&session_dir, std::time::Duration::from_secs(30))
            .context("failed to acquire session write lock")?;

        let Some(session) = self.index.sessions.remove(&session_id) else {
            bail!("unknown session {session_id}");
        };
        if session.dir.exists() {
            fs::remove_dir_all(&session.dir)
                .with_context(|| format!("failed to remove session dir {}", session.dir.display()))?;
        }
        self.persist_index()
    }

    pub fn index_bytes(&self) -> u64 {
        self.index.sessions.values().map(|s| s.bytes_on_disk).sum()
    }

    /// Evict completed-and-sent sessions, oldest (lowest `start_time_ticks`)
    /// first, until total indexed bytes are under `cap_bytes`.
    pub fn evict_to_cap(&mut self, cap_bytes: u64) -> Result<Vec<u128>> {
        let mut evicted = Vec::new();
        while self.index_bytes() > cap_bytes {
            let victim = self
                .index
                .sessions
                .values()
                .filter(|s| s.sent && s.summary.final_status != SessionStatus::Running)
                .min_by_key(|s| s.summary.start_time_ticks)
                .map(|s| s.session_id);

            match victim {
                Some(session_id) => {
                    self.purge(session_id)?;
                    evicted.push(session_id);
                }
                None => break,
            }
        }
        Ok(evicted)
    }

    fn persist_index(&self) -> Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        let tmp_path = index_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.index)
            .context("failed to serialize repository index")?;
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("failed to create index tmp file {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write index tmp file {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync index file")?;
        }
        fs::rename(&tmp_path, &index_path)
            .with_context(|| format!("failed to rename index file to {}", index_path.display()))?;
        if let Some(parent) = index_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn application(&self) -> &str {
        &self.application
    }
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)?.flatten() {
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        } else if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_framing::SessionFileWriter;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_summary(session_id: u128, start_ticks: i64) -> SessionSummary {
        SessionSummary {
            session_id,
            file_id: 1,
            file_sequence: 0,
            product: "Acme".into(),
            application: "Widget".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            cpu_count: 1,
            memory_bytes: 0,
            pid: std::process::id(),
            hostname: "host".into(),
            principal: None,
            start_time_ticks: start_ticks,
            total_messages: 0,
            verbose_count: 0,
            information_count: 0,
            warning_count: 0,
            error_count: 0,
            critical_count: 0,
            end_time_or_heartbeat_ticks: start_ticks,
            final_status: SessionStatus::Normal,
            final_reason: None,
        }
    }

    fn write_closed_session(dir: &Path, session_id: u128, start_ticks: i64) -> PathBuf {
        let path = dir.join(format!("incoming-{session_id}.glf"));
        let writer =
            SessionFileWriter::open(&path, sample_summary(session_id, start_ticks), Duration::from_secs(5))
                .unwrap();
        writer.close(SessionStatus::Normal, None).unwrap();
        path
    }

    #[test]
    fn sanitize_segment_replaces_reserved_characters_and_lowercases() {
        assert_eq!(sanitize_segment("My App/v2"), "my app_v2");
        assert_eq!(sanitize_segment("a:b*c"), "a_b_c");
    }

    #[test]
    fn add_session_moves_file_into_canonical_path_and_updates_index() {
        let td = tempdir().unwrap();
        let mut repo = Repository::open(td.path(), "Acme", "Widget").unwrap();
        let incoming = write_closed_session(td.path(), 42, 100);

        let session_id = repo.add_session(&incoming).unwrap();
        assert_eq!(session_id, 42);
        assert!(!incoming.exists());

        let found: Vec<_> = repo.find(Query::Criteria(SessionCriteria::All)).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, 42);
    }

    #[test]
    fn mark_sent_and_purge_round_trip() {
        let td = tempdir().unwrap();
        let mut repo = Repository::open(td.path(), "Acme", "Widget").unwrap();
        let incoming = write_closed_session(td.path(), 7, 10);
        repo.add_session(&incoming).unwrap();

        repo.mark_sent(7).unwrap();
        let new_only: Vec<_> = repo.find(Query::Criteria(SessionCriteria::New)).collect();
        assert!(new_only.is_empty());

        repo.purge(7).unwrap();
        assert_eq!(repo.find(Query::Criteria(SessionCriteria::All)).count(), 0);
    }

    #[test]
    fn index_survives_reopen_without_sidecar_via_rebuild() {
        let td = tempdir().unwrap();
        {
            let mut repo = Repository::open(td.path(), "Acme", "Widget").unwrap();
            let incoming = write_closed_session(td.path(), 99, 5);
            repo.add_session(&incoming).unwrap();
        }

        let app_dir = td.path().join("acme").join("widget");
        fs::remove_file(app_dir.join(INDEX_FILE)).unwrap();

        let repo = Repository::open(td.path(), "Acme", "Widget").unwrap();
        let found: Vec<_> = repo.find(Query::Criteria(SessionCriteria::All)).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, 99);
    }

    #[test]
    fn evict_to_cap_removes_sent_completed_sessions_oldest_first() {
        let td = tempdir().unwrap();
        let mut repo = Repository::open(td.path(), "Acme", "Widget").unwrap();
        for (id, ticks) in [(1u128, 10i64), (2, 20), (3, 30)] {
            let incoming = write_closed_session(td.path(), id, ticks);
            repo.add_session(&incoming).unwrap();
            repo.mark_sent(id).unwrap();
        }

        let evicted = repo.evict_to_cap(0).unwrap();
        assert_eq!(evicted, vec![1, 2, 3]);
        assert_eq!(repo.index_bytes(), 0);
    }
}
