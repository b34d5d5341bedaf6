//! Resumable HTTP upload engine.
//!
//! Uploads a closed session file to a remote hub using a `HEAD`-then-`PUT`
//! resumable protocol: a `HEAD` request discovers how many bytes the server
//! already has, a local resume marker records the same offset so a retry
//! after a process restart doesn't need to ask the server again, and the
//! `PUT` carries only the unsent tail with a `Content-Range` header.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_lock::LockFile;
use beacon_retry::{RetryExecutor, RetryStrategyConfig, RetryStrategyType};

const RESUME_MARKER_EXT: &str = "resume";
const USER_AGENT: &str = concat!("beacon-upload/", env!("CARGO_PKG_VERSION"));

/// Where uploads are sent: either a hosted-service customer slug (base URL
/// derived from a well-known template) or a fully specified endpoint.
#[derive(Debug, Clone)]
pub enum ServerTarget {
    Hosted {
        customer_name: String,
    },
    Explicit {
        host: String,
        port: u16,
        tls: bool,
        base_path: String,
        repository: String,
    },
}

impl ServerTarget {
    pub fn base_url(&self) -> String {
        match self {
            ServerTarget::Hosted { customer_name } => {
                format!("https://{customer_name}.hub.beacon.dev")
            }
            ServerTarget::Explicit {
                host,
                port,
                tls,
                base_path,
                repository,
            } => {
                let scheme = if *tls { "https" } else { "http" };
                format!(
                    "{scheme}://{host}:{port}/{}/{}",
                    base_path.trim_matches('/'),
                    repository.trim_matches('/')
                )
            }
        }
    }
}

/// Pluggable authentication for the upload engine.
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn login(&self, base_url: &str, http: &reqwest::blocking::Client) -> Result<()>;
    fn logout(&self, base_url: &str, http: &reqwest::blocking::Client) -> Result<()>;

    /// Attach credentials to an outgoing request. Not called at all when
    /// `supports_auth` is false (a server known to be anonymous, e.g. a
    /// local file sink configured as the "server").
    fn preprocess(
        &self,
        request: reqwest::blocking::RequestBuilder,
        resource_url: &str,
        supports_auth: bool,
    ) -> reqwest::blocking::RequestBuilder;
}

/// No credentials attached, ever.
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn login(&self, _base_url: &str, _http: &reqwest::blocking::Client) -> Result<()> {
        Ok(())
    }

    fn logout(&self, _base_url: &str, _http: &reqwest::blocking::Client) -> Result<()> {
        Ok(())
    }

    fn preprocess(
        &self,
        request: reqwest::blocking::RequestBuilder,
        _resource_url: &str,
        _supports_auth: bool,
    ) -> reqwest::blocking::RequestBuilder {
        request
    }
}

/// Stateless HTTP Basic authentication: always considered authenticated
/// once constructed with credentials, and has no login/logout round trip.
pub struct BasicAuth {
    user: String,
    password: String,
}

impl BasicAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl AuthProvider for BasicAuth {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn login(&self, _base_url: &str, _http: &reqwest::blocking::Client) -> Result<()> {
        Ok(())
    }

    fn logout(&self, _base_url: &str, _http: &reqwest::blocking::Client) -> Result<()> {
        Ok(())
    }

    fn preprocess(
        &self,
        request: reqwest::blocking::RequestBuilder,
        _resource_url: &str,
        supports_auth: bool,
    ) -> reqwest::blocking::RequestBuilder {
        if !supports_auth {
            return request;
        }
        request.basic_auth(&self.user, Some(&self.password))
    }
}

/// What happened to one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Sent,
    AlreadyInProgress,
    AuthDenied,
    Permanent(String),
    Ambiguous(String),
}

/// One session file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub session_id: u128,
    pub file_id: u128,
    pub hostname: String,
    pub path: PathBuf,
}

fn transfer_retry_config() -> RetryStrategyConfig {
    RetryStrategyConfig {
        strategy: RetryStrategyType::Exponential,
        max_attempts: 6,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        jitter: 0.3,
    }
}

fn resume_marker_path(file_path: &Path) -> PathBuf {
    file_path.with_extension(RESUME_MARKER_EXT)
}

/// Read the resume marker for `file_path`, validating it against the
/// source's actual length; resets to 0 if the marker claims more bytes
/// than the source contains.
fn read_resume_marker(file_path: &Path, source_len: u64) -> u64 {
    let marker_path = resume_marker_path(file_path);
    let Ok(mut file) = File::open(&marker_path) else {
        return 0;
    };
    let mut buf = [0u8; 8];
    if file.read_exact(&mut buf).is_err() {
        return 0;
    }
    let offset = u64::from_le_bytes(buf);
    if offset > source_len { 0 } else { offset }
}

fn write_resume_marker(file_path: &Path, offset: u64) -> Result<()> {
    let marker_path = resume_marker_path(file_path);
    let tmp_path = marker_path.with_extension("resume.tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create resume marker {}", tmp_path.display()))?;
        file.write_all(&offset.to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &marker_path)
        .with_context(|| format!("failed to rename resume marker {}", marker_path.display()))?;
    Ok(())
}

fn delete_resume_marker(file_path: &Path) {
    let _ = fs::remove_file(resume_marker_path(file_path));
}

/// Transmits session files to a remote hub with resumable uploads and
/// single-request admission control.
pub struct UploadEngine {
    http: reqwest::blocking::Client,
    target: ServerTarget,
    auth: Box<dyn AuthProvider>,
    supports_auth: bool,
    concurrency: usize,
    /// Global gate: a second call to `send_all` while one is in flight
    /// returns immediately with [`UploadOutcome::AlreadyInProgress`] for
    /// every job, rather than overlapping the first.
    in_progress: Arc<AtomicBool>,
}

impl UploadEngine {
    pub fn new(
        target: ServerTarget,
        auth: Box<dyn AuthProvider>,
        supports_auth: bool,
        concurrency: usize,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build upload HTTP client")?;
        Ok(Self {
            http,
            target,
            auth,
            supports_auth,
            concurrency: concurrency.max(1),
            in_progress: Arc::new(AtomicBool::new(false)),
        })
    }

    fn resource_url(&self, job: &UploadJob) -> String {
        format!(
            "{}/hosts/{}/sessions/{}/files/{}",
            self.target.base_url(),
            job.hostname,
            job.session_id,
            job.file_id
        )
    }

    /// Upload every job, at most `concurrency` at a time, via chunked
    /// `std::thread::spawn` batches rather than a generic thread-pool crate.
    pub fn send_all(&self, jobs: Vec<UploadJob>) -> Vec<(UploadJob, UploadOutcome)> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return jobs
                .into_iter()
                .map(|j| (j, UploadOutcome::AlreadyInProgress))
                .collect();
        }

        let mut results = Vec::with_capacity(jobs.len());
        for chunk in jobs.chunks(self.concurrency) {
            let batch = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|job| {
                        let resource_url = self.resource_url(job);
                        scope.spawn(move || {
                            let outcome = send_one(
                                &self.http,
                                resource_url,
                                self.auth.as_ref(),
                                self.supports_auth,
                                job,
                            );
                            (job.clone(), outcome)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("upload worker thread panicked"))
                    .collect::<Vec<_>>()
            });
            results.extend(batch);
        }

        self.in_progress.store(false, Ordering::SeqCst);
        results
    }
}

fn send_one(
    http: &reqwest::blocking::Client,
    resource_url: String,
    auth: &dyn AuthProvider,
    supports_auth: bool,
    job: &UploadJob,
) -> UploadOutcome {
    let session_dir = match job.path.parent() {
        Some(dir) => dir,
        None => return UploadOutcome::Permanent("session file has no parent directory".into()),
    };
    let _lock = match LockFile::acquire_with_timeout(session_dir, Duration::from_secs(30)) {
        Ok(lock) => lock,
        Err(_) => return UploadOutcome::AlreadyInProgress,
    };

    let executor = RetryExecutor::new(transfer_retry_config());
    let outcome =
        executor.run(|_attempt| attempt_upload(http, &resource_url, auth, supports_auth, &job.path));

    match outcome {
        Ok(()) => UploadOutcome::Sent,
        Err(TransferError::AuthDenied) => UploadOutcome::AuthDenied,
        Err(TransferError::Permanent(msg)) => UploadOutcome::Permanent(msg),
        Err(TransferError::Ambiguous(msg)) => UploadOutcome::Ambiguous(msg),
    }
}

enum TransferError {
    AuthDenied,
    Permanent(String),
    Ambiguous(String),
}

fn attempt_upload(
    http: &reqwest::blocking::Client,
    resource_url: &str,
    auth: &dyn AuthProvider,
    supports_auth: bool,
    file_path: &Path,
) -> std::result::Result<(), TransferError> {
    let source_len = fs::metadata(file_path)
        .map_err(|e| TransferError::Ambiguous(format!("cannot stat source file: {e}")))?
        .len();

    let committed = head_committed_bytes(http, resource_url, auth, supports_auth)?;
    let marker_offset = read_resume_marker(file_path, source_len);
    let start_offset = committed.max(marker_offset).min(source_len);

    if start_offset >= source_len {
        delete_resume_marker(file_path);
        return Ok(());
    }

    let mut file = File::open(file_path)
        .map_err(|e| TransferError::Ambiguous(format!("cannot reopen source file: {e}")))?;
    file.seek(SeekFrom::Start(start_offset))
        .map_err(|e| TransferError::Ambiguous(format!("cannot seek source file: {e}")))?;
    let mut body = Vec::with_capacity((source_len - start_offset) as usize);
    file.read_to_end(&mut body)
        .map_err(|e| TransferError::Ambiguous(format!("cannot read source file: {e}")))?;

    let content_range = format!(
        "bytes {}-{}/{}",
        start_offset,
        source_len.saturating_sub(1),
        source_len
    );
    let request = http
        .put(resource_url)
        .header("Content-Range", content_range)
        .body(body);
    let request = auth.preprocess(request, resource_url, supports_auth);

    let response = request.send().map_err(|e| classify_transport(&e))?;

    let status = response.status();
    if status.is_success() {
        delete_resume_marker(file_path);
        return Ok(());
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(TransferError::AuthDenied);
    }
    if status.is_server_error() {
        let ack = response
            .headers()
            .get("X-Acknowledged-Offset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(start_offset);
        let _ = write_resume_marker(file_path, ack);
        return Err(TransferError::Ambiguous(format!("server error {status}")));
    }
    Err(TransferError::Permanent(format!("unexpected status {status}")))
}

fn head_committed_bytes(
    http: &reqwest::blocking::Client,
    resource_url: &str,
    auth: &dyn AuthProvider,
    supports_auth: bool,
) -> std::result::Result<u64, TransferError> {
    let request = http.head(resource_url);
    let request = auth.preprocess(request, resource_url, supports_auth);
    let response = request.send().map_err(|e| classify_transport(&e))?;

    match response.status() {
        reqwest::StatusCode::NOT_FOUND => Ok(0),
        status if status.is_success() => Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)),
        status if status.as_u16() == 401 || status.as_u16() == 403 => {
            Err(TransferError::AuthDenied)
        }
        status => Err(TransferError::Ambiguous(format!(
            "unexpected HEAD status {status}"
        ))),
    }
}

fn classify_transport(e: &reqwest::Error) -> TransferError {
    if e.is_timeout() || e.is_connect() {
        TransferError::Ambiguous(format!("transport error: {e}"))
    } else {
        TransferError::Permanent(format!("request failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    fn explicit_target(port: u16) -> ServerTarget {
        ServerTarget::Explicit {
            host: "127.0.0.1".into(),
            port,
            tls: false,
            base_path: "".into(),
            repository: "".into(),
        }
    }

    #[test]
    fn base_url_formats_hosted_and_explicit_targets() {
        let hosted = ServerTarget::Hosted {
            customer_name: "acme".into(),
        };
        assert_eq!(hosted.base_url(), "https://acme.hub.beacon.dev");

        let explicit = explicit_target(8080);
        assert_eq!(explicit.base_url(), "http://127.0.0.1:8080/");
    }

    #[test]
    fn resume_marker_resets_when_it_claims_more_than_the_source_has() {
        let td = tempdir().unwrap();
        let path = td.path().join("0.glf");
        fs::write(&path, b"hello").unwrap();
        write_resume_marker(&path, 999).unwrap();
        assert_eq!(read_resume_marker(&path, 5), 0);

        write_resume_marker(&path, 3).unwrap();
        assert_eq!(read_resume_marker(&path, 5), 3);
    }

    #[test]
    fn full_upload_completes_in_one_put_and_deletes_marker() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let seen_puts = Arc::new(AtomicUsize::new(0));
        let seen_puts_clone = Arc::clone(&seen_puts);

        let handle = std::thread::spawn(move || {
            for request in server.incoming_requests().take(2) {
                match request.method() {
                    tiny_http::Method::Head => {
                        let response = Response::empty(404);
                        let _ = request.respond(response);
                    }
                    tiny_http::Method::Put => {
                        seen_puts_clone.fetch_add(1, Ordering::SeqCst);
                        let response = Response::empty(200);
                        let _ = request.respond(response);
                    }
                    _ => {
                        let _ = request.respond(Response::empty(405));
                    }
                }
            }
        });

        let td = tempdir().unwrap();
        let session_dir = td.path().join("session");
        fs::create_dir_all(&session_dir).unwrap();
        let path = session_dir.join("0.glf");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"some session bytes").unwrap();

        let engine = UploadEngine::new(explicit_target(port), Box::new(NoAuth), false, 2).unwrap();
        let job = UploadJob {
            session_id: 1,
            file_id: 1,
            hostname: "host".into(),
            path: path.clone(),
        };
        let results = engine.send_all(vec![job]);
        handle.join().unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, UploadOutcome::Sent);
        assert_eq!(seen_puts.load(Ordering::SeqCst), 1);
        assert!(!resume_marker_path(&path).exists());
    }

    #[test]
    fn second_send_all_call_while_in_flight_reports_already_in_progress() {
        let engine = UploadEngine::new(explicit_target(1), Box::new(NoAuth), false, 1).unwrap();
        engine.in_progress.store(true, Ordering::SeqCst);

        let job = UploadJob {
            session_id: 1,
            file_id: 1,
            hostname: "host".into(),
            path: PathBuf::from("/nonexistent/0.glf"),
        };
        let results = engine.send_all(vec![job]);
        assert_eq!(results[0].1, UploadOutcome::AlreadyInProgress);
    }
}
