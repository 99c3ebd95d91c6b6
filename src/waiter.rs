//! Coalesced waiting for torrent metadata.
//!
//! Right after a torrent is added TorrServer does not know its file list yet.
//! Callers that need media info for such a torrent register here. One polling
//! campaign runs per info hash no matter how many callers wait on it; when the
//! campaign concludes every registered caller gets an outcome, and the
//! campaign is removed so the next caller starts from scratch.

use crate::remote::RemoteOutcome;
use crate::torrserver::{TorrentLookup, file_stats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub max_attempts: u32,
    pub interval: Duration,
}

struct Waiter {
    index: u64,
    reply: oneshot::Sender<RemoteOutcome>,
}

struct Campaign {
    id: u64,
    pending: Vec<Waiter>,
    attempts: u32,
    settings: PollSettings,
    started_at: Instant,
    ticker: Option<JoinHandle<()>>,
}

impl Campaign {
    /// Consumes the campaign, stopping its ticker and handing back the waiters.
    fn close(self) -> Vec<Waiter> {
        if let Some(ticker) = self.ticker {
            ticker.abort();
        }
        self.pending
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Pending,
    Ready { files: usize },
    Failed(RemoteOutcome),
}

/// Classifies the result of one readiness check.
///
/// A ready torrent wins even when this was the last allowed attempt.
fn assess(outcome: &RemoteOutcome, attempts: u32, max_attempts: u32) -> Verdict {
    let exhausted = attempts >= max_attempts;
    match outcome.status {
        200 => match outcome.json() {
            Err(err) => Verdict::Failed(RemoteOutcome::error(
                500,
                format!("Error checking torrent: {err}"),
            )),
            Ok(torrent) => match file_stats(&torrent) {
                Some(stats) => Verdict::Ready { files: stats.len() },
                None if exhausted => Verdict::Failed(RemoteOutcome::error(
                    408,
                    "Timeout waiting for torrent metadata",
                )),
                None => Verdict::Pending,
            },
        },
        404 if exhausted => Verdict::Failed(RemoteOutcome::error(404, "Torrent not available")),
        _ if exhausted => Verdict::Failed(outcome.clone()),
        _ => Verdict::Pending,
    }
}

/// Registry of in-flight metadata campaigns, keyed by info hash.
///
/// Cheap to clone; all clones share one registry. Keys are compared exactly
/// as given.
pub struct MetadataWaiter<S> {
    inner: Arc<WaiterInner<S>>,
}

impl<S> Clone for MetadataWaiter<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct WaiterInner<S> {
    source: Arc<S>,
    defaults: PollSettings,
    settle_delay: Duration,
    next_id: AtomicU64,
    campaigns: Mutex<HashMap<String, Campaign>>,
}

impl<S: TorrentLookup> MetadataWaiter<S> {
    pub fn new(source: Arc<S>, defaults: PollSettings, settle_delay: Duration) -> Self {
        Self {
            inner: Arc::new(WaiterInner {
                source,
                defaults,
                settle_delay,
                next_id: AtomicU64::new(1),
                campaigns: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn defaults(&self) -> PollSettings {
        self.inner.defaults
    }

    /// Number of campaigns currently polling.
    pub fn in_flight(&self) -> usize {
        self.inner.registry().len()
    }

    /// Registers interest in file `index` of `hash` and returns immediately.
    ///
    /// The receiver yields the media probe for that file once the torrent's
    /// metadata has loaded, or the terminal failure of the campaign. Settings
    /// only apply when this call opens a new campaign.
    pub fn wait_until_ready(
        &self,
        hash: &str,
        index: u64,
        settings: Option<PollSettings>,
    ) -> oneshot::Receiver<RemoteOutcome> {
        let (reply, rx) = oneshot::channel();
        let waiter = Waiter { index, reply };

        let mut campaigns = self.inner.registry();
        if let Some(campaign) = campaigns.get_mut(hash) {
            campaign.pending.push(waiter);
            tracing::debug!(%hash, index, waiting = campaign.pending.len(), "waiter: joined campaign");
            return rx;
        }

        let settings = settings.unwrap_or(self.inner.defaults);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let ticker = tokio::spawn(run_ticker(self.inner.clone(), hash.to_string(), id, settings));
        campaigns.insert(
            hash.to_string(),
            Campaign {
                id,
                pending: vec![waiter],
                attempts: 0,
                settings,
                started_at: Instant::now(),
                ticker: Some(ticker),
            },
        );
        tracing::debug!(
            %hash,
            index,
            max_attempts = settings.max_attempts,
            interval_ms = settings.interval.as_millis() as u64,
            "waiter: campaign started"
        );
        rx
    }

    /// Waits for metadata, then returns the media probe for `index`.
    pub async fn probe_when_ready(
        &self,
        hash: &str,
        index: u64,
        settings: Option<PollSettings>,
    ) -> RemoteOutcome {
        self.wait_until_ready(hash, index, settings)
            .await
            .unwrap_or_else(|_| RemoteOutcome::error(500, "metadata wait abandoned"))
    }
}

impl<S> WaiterInner<S> {
    fn registry(&self) -> MutexGuard<'_, HashMap<String, Campaign>> {
        self.campaigns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: TorrentLookup> WaiterInner<S> {
    /// Counts a new attempt. Returns false if the campaign is gone.
    fn begin_check(&self, hash: &str, id: u64) -> bool {
        match self.registry().get_mut(hash) {
            Some(campaign) if campaign.id == id => {
                campaign.attempts += 1;
                true
            }
            _ => false,
        }
    }

    fn settle(self: &Arc<Self>, hash: &str, id: u64, outcome: RemoteOutcome) {
        let mut campaigns = self.registry();
        // A check may land after its campaign already concluded, or after a
        // newer campaign for the same hash took its slot.
        let Some(campaign) = campaigns.get(hash).filter(|c| c.id == id) else {
            return;
        };

        let attempts = campaign.attempts;
        let verdict = assess(&outcome, attempts, campaign.settings.max_attempts);
        if verdict == Verdict::Pending {
            tracing::trace!(%hash, attempts, status = outcome.status, "waiter: not ready yet");
            return;
        }

        let Some(campaign) = campaigns.remove(hash) else {
            return;
        };
        drop(campaigns);
        let elapsed_secs = campaign.started_at.elapsed().as_secs();
        let waiters = campaign.close();

        match verdict {
            Verdict::Ready { files } => {
                tracing::info!(
                    %hash,
                    elapsed_secs,
                    files,
                    waiters = waiters.len(),
                    "waiter: metadata loaded; probing"
                );
                for Waiter { index, reply } in waiters {
                    let inner = self.clone();
                    let hash = hash.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(inner.settle_delay).await;
                        let outcome = inner.source.probe(&hash, index).await;
                        let _ = reply.send(outcome);
                    });
                }
            }
            Verdict::Failed(outcome) => {
                tracing::warn!(
                    %hash,
                    attempts,
                    elapsed_secs,
                    status = outcome.status,
                    waiters = waiters.len(),
                    "waiter: campaign failed"
                );
                for Waiter { reply, .. } in waiters {
                    let _ = reply.send(outcome.clone());
                }
            }
            Verdict::Pending => {}
        }
    }
}

/// Issues up to `max_attempts` checks, one per tick, the first immediately.
///
/// Each check runs in its own task so a slow response does not delay the
/// cadence. The campaign aborts this task when it concludes.
async fn run_ticker<S: TorrentLookup>(
    inner: Arc<WaiterInner<S>>,
    hash: String,
    id: u64,
    settings: PollSettings,
) {
    let mut tick = interval(settings.interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for _ in 0..settings.max_attempts.max(1) {
        tick.tick().await;
        if !inner.begin_check(&hash, id) {
            return;
        }

        let inner = inner.clone();
        let hash = hash.clone();
        tokio::spawn(async move {
            let outcome = inner.source.lookup(&hash).await;
            inner.settle(&hash, id, outcome);
        });
    }
}
