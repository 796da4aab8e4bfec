// file: src/pipeline/progress.rs
// description: ordered, coalescing delivery of transfer progress to the chat sink
// reference: channel-fed single consumer task with atomic counters

use crate::chat::{MessageRef, NotificationSink};
use crate::config::ProgressConfig;
use crate::models::RequesterId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Callback handed to the extractor: `(fraction_complete, eta_seconds)`.
pub type DownloadProgressFn = Arc<dyn Fn(f64, Option<u64>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    Download {
        fraction: f64,
        eta_seconds: Option<u64>,
    },
    Upload {
        bytes_sent: u64,
        total_bytes: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Download,
    Upload,
}

impl ProgressEvent {
    fn phase(&self) -> Phase {
        match self {
            ProgressEvent::Download { .. } => Phase::Download,
            ProgressEvent::Upload { .. } => Phase::Upload,
        }
    }

    pub fn percent(&self) -> f64 {
        let fraction = match *self {
            ProgressEvent::Download { fraction, .. } => fraction,
            ProgressEvent::Upload {
                bytes_sent,
                total_bytes,
            } => {
                if total_bytes == 0 {
                    1.0
                } else {
                    bytes_sent as f64 / total_bytes as f64
                }
            }
        };
        (fraction.clamp(0.0, 1.0) * 100.0 * 10.0).round() / 10.0
    }

    pub fn render(&self) -> String {
        match *self {
            ProgressEvent::Download { eta_seconds, .. } => match eta_seconds {
                Some(eta) => format!(
                    "⏬ Downloading: {:.1}% · ETA {}",
                    self.percent(),
                    format_eta(eta)
                ),
                None => format!("⏬ Downloading: {:.1}%", self.percent()),
            },
            ProgressEvent::Upload {
                bytes_sent,
                total_bytes,
            } => format!(
                "⏫ Uploading: {:.1} / {:.1} MB ({:.1}%)",
                bytes_sent as f64 / 1_048_576.0,
                total_bytes as f64 / 1_048_576.0,
                self.percent()
            ),
        }
    }
}

fn format_eta(seconds: u64) -> String {
    if seconds >= 3600 {
        format!("{}h {:02}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds >= 60 {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub events_received: usize,
    pub events_dropped: usize,
    pub notifications_sent: usize,
}

#[derive(Default)]
struct RelayCounters {
    received: AtomicUsize,
    dropped: AtomicUsize,
    sent: AtomicUsize,
}

enum RelayMessage {
    Progress {
        job_id: Uuid,
        requester: RequesterId,
        event: ProgressEvent,
    },
    Settle {
        job_id: Uuid,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
struct ThrottlePolicy {
    min_interval: Duration,
    min_step_percent: f64,
}

/// Handle to the relay task. Cloning is cheap; the task stops once every
/// handle and sender is dropped.
#[derive(Clone)]
pub struct ProgressRelay {
    tx: mpsc::Sender<RelayMessage>,
    counters: Arc<RelayCounters>,
}

impl ProgressRelay {
    pub fn spawn(sink: Arc<dyn NotificationSink>, config: &ProgressConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let counters = Arc::new(RelayCounters::default());
        let policy = ThrottlePolicy {
            min_interval: config.min_interval(),
            min_step_percent: config.min_step_percent,
        };

        let worker = RelayWorker {
            sink,
            policy,
            lanes: HashMap::new(),
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(worker.run(rx));

        (Self { tx, counters }, handle)
    }

    pub fn sender(&self, job_id: Uuid, requester: RequesterId) -> ProgressSender {
        ProgressSender {
            job_id,
            requester,
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Discards anything still pending for the job and waits until the relay
    /// will no longer touch it, so later notifications cannot be overtaken.
    pub async fn settle(&self, job_id: Uuid) {
        let (done, wait) = oneshot::channel();
        if self
            .tx
            .send(RelayMessage::Settle { job_id, done })
            .await
            .is_ok()
        {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            events_received: self.counters.received.load(Ordering::SeqCst),
            events_dropped: self.counters.dropped.load(Ordering::SeqCst),
            notifications_sent: self.counters.sent.load(Ordering::SeqCst),
        }
    }
}

/// Producer side given to adapters. Never blocks and never awaits, so it is
/// safe to call from extractor threads.
#[derive(Clone)]
pub struct ProgressSender {
    job_id: Uuid,
    requester: RequesterId,
    tx: mpsc::Sender<RelayMessage>,
    counters: Arc<RelayCounters>,
}

impl ProgressSender {
    pub fn report(&self, event: ProgressEvent) -> bool {
        self.counters.received.fetch_add(1, Ordering::SeqCst);

        match self.tx.try_send(RelayMessage::Progress {
            job_id: self.job_id,
            requester: self.requester,
            event,
        }) {
            Ok(()) => true,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn download_callback(&self) -> DownloadProgressFn {
        let sender = self.clone();
        Arc::new(move |fraction, eta_seconds| {
            sender.report(ProgressEvent::Download {
                fraction,
                eta_seconds,
            });
        })
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

struct Lane {
    requester: RequesterId,
    message: Option<MessageRef>,
    last_phase: Option<Phase>,
    last_percent: f64,
    last_sent: Option<Instant>,
    pending: Option<ProgressEvent>,
}

impl Lane {
    fn new(requester: RequesterId) -> Self {
        Self {
            requester,
            message: None,
            last_phase: None,
            last_percent: 0.0,
            last_sent: None,
            pending: None,
        }
    }

    /// Keeps only the newest event that still moves the lane forward.
    fn offer(&mut self, event: ProgressEvent) {
        let advances = match self.last_phase {
            Some(phase) if phase == event.phase() => event.percent() > self.last_percent,
            _ => true,
        };
        if advances {
            self.pending = Some(event);
        }
    }

    fn is_due(&self, event: &ProgressEvent, now: Instant, policy: &ThrottlePolicy) -> bool {
        let (Some(phase), Some(sent)) = (self.last_phase, self.last_sent) else {
            return true;
        };
        if phase != event.phase() {
            return true;
        }

        let percent = event.percent();
        percent > self.last_percent
            && now.duration_since(sent) >= policy.min_interval
            && (percent - self.last_percent >= policy.min_step_percent || percent >= 100.0)
    }
}

struct RelayWorker {
    sink: Arc<dyn NotificationSink>,
    policy: ThrottlePolicy,
    lanes: HashMap<Uuid, Lane>,
    counters: Arc<RelayCounters>,
}

impl RelayWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<RelayMessage>) {
        let tick = (self.policy.min_interval / 4).max(Duration::from_millis(50));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(RelayMessage::Progress { job_id, requester, event }) => {
                        self.lanes
                            .entry(job_id)
                            .or_insert_with(|| Lane::new(requester))
                            .offer(event);
                        self.flush(job_id).await;
                    }
                    Some(RelayMessage::Settle { job_id, done }) => {
                        if self.lanes.remove(&job_id).is_some() {
                            trace!(%job_id, "Progress lane settled");
                        }
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let due: Vec<Uuid> = self
                        .lanes
                        .iter()
                        .filter(|(_, lane)| lane.pending.is_some())
                        .map(|(id, _)| *id)
                        .collect();
                    for job_id in due {
                        self.flush(job_id).await;
                    }
                }
            }
        }

        debug!("Progress relay stopped");
    }

    async fn flush(&mut self, job_id: Uuid) {
        let now = Instant::now();
        let Some(lane) = self.lanes.get_mut(&job_id) else {
            return;
        };
        let Some(event) = lane.pending else {
            return;
        };
        if !lane.is_due(&event, now, &self.policy) {
            return;
        }

        lane.pending = None;
        if lane.last_phase != Some(event.phase()) {
            lane.message = None;
        }
        lane.last_phase = Some(event.phase());
        lane.last_percent = event.percent();
        lane.last_sent = Some(now);

        let text = event.render();
        let delivered = match lane.message {
            Some(message) => self.sink.edit_text(lane.requester, message, &text).await,
            None => match self.sink.send_text(lane.requester, &text).await {
                Ok(message) => {
                    lane.message = Some(message);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match delivered {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!(%job_id, "Progress notification failed: {}", e),
        }
    }
}
