//! Publisher: single-consumer, multi-producer fan-out from producer threads
//! to messengers and notifier subscribers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use beacon_framing::{LogRecord, MetricSampleRecord, Severity, SessionStatus, SessionSummary};

use crate::errors::{AgentError, Result};
use crate::filter::FilterChain;
use crate::messenger::SessionFileMessenger;
use crate::notifier::Notifier;

enum Envelope {
    Log {
        record: LogRecord,
        wait_for_commit: bool,
        ack: Option<Sender<()>>,
    },
    Metric {
        record: MetricSampleRecord,
        wait_for_commit: bool,
        ack: Option<Sender<()>>,
    },
    EndFile,
    EndSession {
        status: SessionStatus,
        reason: Option<String>,
        reply: Sender<io::Result<SessionSummary>>,
    },
}

/// Shared backpressure bookkeeping between producers and the consumer.
struct Backpressure {
    queue_len: AtomicUsize,
    soft_cap: usize,
    dropped: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl Backpressure {
    fn enqueued(&self) {
        self.queue_len.fetch_add(1, Ordering::SeqCst);
    }

    fn dequeued(&self) {
        self.queue_len.fetch_sub(1, Ordering::SeqCst);
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }

    fn at_cap(&self) -> bool {
        self.queue_len.load(Ordering::SeqCst) >= self.soft_cap
    }

    /// Block until the queue drops below the soft cap or `deadline` elapses.
    /// Returns `true` if room is now available.
    fn wait_for_room(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        let mut guard = self.mutex.lock().unwrap();
        while self.at_cap() {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return false;
            }
            let (g, timeout) = self
                .condvar
                .wait_timeout(guard, deadline - elapsed)
                .unwrap();
            guard = g;
            if timeout.timed_out() && self.at_cap() {
                return false;
            }
        }
        true
    }
}

/// Producer-facing handle. Cheap to clone; every producer thread holds one.
#[derive(Clone)]
pub struct PublisherHandle {
    sender: Sender<Envelope>,
    sequence: Arc<AtomicU64>,
    backpressure: Arc<Backpressure>,
    backpressure_deadline: Duration,
    silent: Arc<AtomicBool>,
}

impl PublisherHandle {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Submit a log record. Returns immediately unless `wait_for_commit` is
    /// set, in which case it blocks until the messenger has durably written
    /// the record (or degraded, which is still treated as "handled").
    pub fn publish_log(&self, mut record: LogRecord, wait_for_commit: bool) -> Result<()> {
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        record.sequence = self.next_sequence();

        if self.backpressure.at_cap() {
            if record.severity < Severity::Warning {
                self.backpressure.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            if !self.backpressure.wait_for_room(self.backpressure_deadline) {
                return Err(AgentError::QueueSaturated);
            }
        }

        let (envelope, ack_rx) = if wait_for_commit {
            let (tx, rx) = mpsc::channel();
            (
                Envelope::Log {
                    record,
                    wait_for_commit,
                    ack: Some(tx),
                },
                Some(rx),
            )
        } else {
            (
                Envelope::Log {
                    record,
                    wait_for_commit,
                    ack: None,
                },
                None,
            )
        };

        self.backpressure.enqueued();
        self.sender
            .send(envelope)
            .map_err(|_| AgentError::MessengerDegraded("publisher thread is gone".into()))?;

        if let Some(rx) = ack_rx {
            let _ = rx.recv();
        }
        Ok(())
    }

    pub fn publish_metric(&self, record: MetricSampleRecord, wait_for_commit: bool) -> Result<()> {
        if self.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (envelope, ack_rx) = if wait_for_commit {
            let (tx, rx) = mpsc::channel();
            (
                Envelope::Metric {
                    record,
                    wait_for_commit,
                    ack: Some(tx),
                },
                Some(rx),
            )
        } else {
            (
                Envelope::Metric {
                    record,
                    wait_for_commit,
                    ack: None,
                },
                None,
            )
        };

        self.backpressure.enqueued();
        self.sender
            .send(envelope)
            .map_err(|_| AgentError::MessengerDegraded("publisher thread is gone".into()))?;

        if let Some(rx) = ack_rx {
            let _ = rx.recv();
        }
        Ok(())
    }

    pub fn end_file(&self) -> Result<()> {
        self.backpressure.enqueued();
        self.sender
            .send(Envelope::EndFile)
            .map_err(|_| AgentError::MessengerDegraded("publisher thread is gone".into()))
    }

    /// Enter silent mode: further `publish_*` calls are a no-op returning
    /// success, without touching the queue at all. Used after `cancel()`.
    pub fn cancel(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    pub fn dropped_count(&self) -> u64 {
        self.backpressure.dropped.load(Ordering::SeqCst)
    }
}

/// Owns the consumer thread. [`Publisher::start`] spawns it and blocks until
/// the thread signals it is running, so a `publish` immediately after
/// `start` is never lost.
pub struct Publisher {
    handle: PublisherHandle,
    stop_tx: Sender<Envelope>,
    join: Option<JoinHandle<()>>,
}

impl Publisher {
    pub fn start(
        filters: FilterChain,
        mut messenger: SessionFileMessenger,
        notifier: Notifier,
        queue_soft_cap: usize,
        backpressure_deadline: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<Envelope>();
        let backpressure = Arc::new(Backpressure {
            queue_len: AtomicUsize::new(0),
            soft_cap: queue_soft_cap,
            dropped: AtomicU64::new(0),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        });
        let silent = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<()>();

        let consumer_backpressure = Arc::clone(&backpressure);
        let join = thread::spawn(move || {
            let _ = ready_tx.send(());
            loop {
                match receiver.recv_timeout(Duration::from_millis(200)) {
                    Ok(Envelope::EndSession {
                        status,
                        reason,
                        reply,
                    }) => {
                        consumer_backpressure.dequeued();
                        let result = messenger.close(status, reason);
                        let _ = reply.send(result);
                        break;
                    }
                    Ok(envelope) => {
                        Self::handle_envelope(envelope, &filters, &mut messenger, &notifier);
                        consumer_backpressure.dequeued();
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        let _ = ready_rx.recv_timeout(Duration::from_secs(5));

        let handle = PublisherHandle {
            sender: sender.clone(),
            sequence: Arc::new(AtomicU64::new(0)),
            backpressure,
            backpressure_deadline,
            silent,
        };

        Publisher {
            handle,
            stop_tx: sender,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    fn handle_envelope(
        envelope: Envelope,
        filters: &FilterChain,
        messenger: &mut SessionFileMessenger,
        notifier: &Notifier,
    ) {
        match envelope {
            Envelope::Log {
                mut record,
                wait_for_commit,
                ack,
            } => {
                if filters.apply(&mut record) {
                    notifier.publish(&record);
                    if let Err(e) = messenger.write_log(record, wait_for_commit) {
                        log::warn!("session file write failed: {e}");
                    }
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Envelope::Metric {
                record,
                wait_for_commit,
                ack,
            } => {
                if let Err(e) = messenger.write_metric_sample(record, wait_for_commit) {
                    log::warn!("session file metric write failed: {e}");
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Envelope::EndFile => {
                if let Err(e) = messenger.end_file() {
                    log::warn!("explicit end_file failed: {e}");
                }
            }
            Envelope::EndSession { .. } => unreachable!("handled directly by the consumer loop"),
        }
    }

    /// Two-phase drain: silence producers, flush the queue through the
    /// messenger, then close it. If the consumer thread does not finish
    /// within `drain_deadline`, the thread is detached (never killed) and a
    /// degraded diagnostic is logged; `None` is returned in that case.
    pub fn stop(
        self,
        status: SessionStatus,
        reason: Option<String>,
        drain_deadline: Duration,
    ) -> Option<SessionSummary> {
        self.handle.cancel();
        let (reply_tx, reply_rx) = mpsc::channel();
        if self
            .stop_tx
            .send(Envelope::EndSession {
                status,
                reason,
                reply: reply_tx,
            })
            .is_err()
        {
            log::warn!("publisher consumer thread already gone at shutdown");
            return None;
        }

        match reply_rx.recv_timeout(drain_deadline) {
            Ok(Ok(summary)) => {
                if let Some(join) = self.join {
                    let _ = join.join();
                }
                Some(summary)
            }
            Ok(Err(e)) => {
                log::warn!("session close failed during drain: {e}");
                None
            }
            Err(_) => {
                log::warn!("publisher drain deadline elapsed; detaching consumer thread");
                None
            }
        }
    }
}
