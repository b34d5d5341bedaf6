//! Coalescing notifier fan-out.
//!
//! Two logical streams exist: `MessagePublished` (every non-suppressed
//! record) and `MessageAlert` (severity >= Warning). Each registered
//! subscriber gets its own dedicated delivery thread: while its handler is
//! running, further records accumulate; on return a single batch is
//! delivered. A subscriber may request a minimum delay between deliveries;
//! accumulated records beyond the configured cap are dropped, and the drop
//! count is reported in the next batch.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use beacon_framing::{LogRecord, Severity};

/// Which of the two logical streams a subscriber is registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    MessagePublished,
    MessageAlert,
}

impl Stream {
    fn accepts(self, severity: Severity) -> bool {
        match self {
            Stream::MessagePublished => true,
            Stream::MessageAlert => severity >= Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeverityCounts {
    pub verbose: u64,
    pub information: u64,
    pub warning: u64,
    pub error: u64,
    pub critical: u64,
}

impl SeverityCounts {
    fn count(&mut self, severity: Severity) {
        match severity {
            Severity::Verbose => self.verbose += 1,
            Severity::Information => self.information += 1,
            Severity::Warning => self.warning += 1,
            Severity::Error => self.error += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.verbose + self.information + self.warning + self.error + self.critical
    }
}

/// One coalesced delivery to a subscriber's handler.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub counts_by_severity: SeverityCounts,
    pub exception_count: u64,
    pub dropped_count: u64,
    pub messages: Vec<LogRecord>,
}

/// Implemented by notifier subscribers. `on_batch` runs on the subscriber's
/// dedicated delivery thread, never on the publisher thread.
pub trait Subscriber: Send + 'static {
    fn on_batch(&mut self, batch: Batch);

    /// The minimum delay the notifier must wait between the start of one
    /// delivery and the start of the next. Defaults to no minimum.
    fn minimum_delay(&self) -> Duration {
        Duration::ZERO
    }
}

struct Pending {
    batch: Batch,
    closed: bool,
}

struct Shared {
    state: Mutex<Pending>,
    condvar: Condvar,
}

/// A running subscription. Dropping it stops accepting new records but does
/// not interrupt a delivery already in progress; join the handle to wait for
/// a clean shutdown.
pub struct Subscription {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    cap: usize,
}

impl Subscription {
    /// Spawn a dedicated delivery thread for `subscriber` on `stream`, with
    /// accumulated records beyond `cap` dropped oldest-first.
    pub fn spawn<S: Subscriber>(stream: Stream, cap: usize, mut subscriber: S) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(Pending {
                batch: Batch::default(),
                closed: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);

        let handle = thread::spawn(move || {
            let mut last_delivery: Option<Instant> = Some(Instant::now());
            loop {
                let min_delay = subscriber.minimum_delay();
                let mut guard = worker_shared.state.lock().unwrap();
                loop {
                    if guard.closed && guard.batch.messages.is_empty() {
                        return;
                    }
                    if !guard.batch.messages.is_empty() {
                        if let Some(last) = last_delivery {
                            let elapsed = last.elapsed();
                            if elapsed < min_delay {
                                let (g, _timeout) = worker_shared
                                    .condvar
                                    .wait_timeout(guard, min_delay - elapsed)
                                    .unwrap();
                                guard = g;
                                continue;
                            }
                        }
                        break;
                    }
                    guard = worker_shared.condvar.wait(guard).unwrap();
                }
                let batch = std::mem::take(&mut guard.batch);
                drop(guard);

                subscriber.on_batch(batch);
                last_delivery = Some(Instant::now());
            }
        });

        let _ = stream; // stream membership is enforced by the caller via `offer`'s filtering.
        Self {
            shared,
            handle: Some(handle),
            cap,
        }
    }

    /// Accumulate a record for this subscriber's next delivery, dropping the
    /// oldest accumulated record if `cap` would be exceeded.
    fn offer(&self, record: &LogRecord) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.batch.counts_by_severity.count(record.severity);
        if record.exception.is_some() {
            guard.batch.exception_count += 1;
        }
        if guard.batch.messages.len() >= self.cap {
            guard.batch.messages.remove(0);
            guard.batch.dropped_count += 1;
        }
        guard.batch.messages.push(record.clone());
        self.shared.condvar.notify_one();
    }

    fn close(&self) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.closed = true;
        self.shared.condvar.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Fans non-suppressed records out to every registered subscriber on the
/// stream(s) it qualifies for.
#[derive(Default)]
pub struct Notifier {
    subscriptions: Vec<(Stream, Subscription)>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<S: Subscriber>(&mut self, stream: Stream, cap: usize, subscriber: S) {
        self.subscriptions
            .push((stream, Subscription::spawn(stream, cap, subscriber)));
    }

    /// Offer a published (non-suppressed) record to every subscriber whose
    /// stream accepts it.
    pub fn publish(&self, record: &LogRecord) {
        for (stream, subscription) in &self.subscriptions {
            if stream.accepts(record.severity) {
                subscription.offer(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sample_log(severity: Severity) -> LogRecord {
        LogRecord {
            sequence: 1,
            severity,
            category: "cat".into(),
            timestamp_ticks: 0,
            thread_id: 1,
            source: Default::default(),
            caption: "hello".into(),
            description: "desc".into(),
            details: None,
            exception: None,
            principal: None,
        }
    }

    struct Collector {
        tx: mpsc::Sender<Batch>,
        min_delay: Duration,
    }

    impl Subscriber for Collector {
        fn on_batch(&mut self, batch: Batch) {
            let _ = self.tx.send(batch);
        }

        fn minimum_delay(&self) -> Duration {
            self.min_delay
        }
    }

    #[test]
    fn message_alert_stream_only_accepts_warning_and_above() {
        assert!(Stream::MessageAlert.accepts(Severity::Warning));
        assert!(Stream::MessageAlert.accepts(Severity::Critical));
        assert!(!Stream::MessageAlert.accepts(Severity::Information));
        assert!(Stream::MessagePublished.accepts(Severity::Verbose));
    }

    #[test]
    fn coalesces_rapid_records_into_batches() {
        let (tx, rx) = mpsc::channel();
        let mut notifier = Notifier::new();
        notifier.subscribe(
            Stream::MessagePublished,
            1024,
            Collector {
                tx,
                min_delay: Duration::from_millis(50),
            },
        );

        for _ in 0..50 {
            notifier.publish(&sample_log(Severity::Error));
        }

        let batch = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(batch.counts_by_severity.total() >= 1);
        assert!(batch.counts_by_severity.total() <= 50);

        let mut total = batch.counts_by_severity.total();
        while total < 50 {
            let next = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            total += next.counts_by_severity.total();
        }
        assert_eq!(total, 50);
    }

    #[test]
    fn drops_oldest_beyond_cap_and_reports_dropped_count() {
        let (tx, rx) = mpsc::channel();
        let mut notifier = Notifier::new();
        notifier.subscribe(
            Stream::MessagePublished,
            2,
            Collector {
                tx,
                min_delay: Duration::from_millis(200),
            },
        );

        for _ in 0..5 {
            notifier.publish(&sample_log(Severity::Information));
        }

        let batch = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.dropped_count, 3);
    }

    #[test]
    fn first_delivery_is_also_gated_by_minimum_delay() {
        let (tx, rx) = mpsc::channel();
        let mut notifier = Notifier::new();
        notifier.subscribe(
            Stream::MessagePublished,
            1024,
            Collector {
                tx,
                min_delay: Duration::from_millis(300),
            },
        );

        let started = Instant::now();
        notifier.publish(&sample_log(Severity::Information));
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
