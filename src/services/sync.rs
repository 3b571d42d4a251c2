use chrono::{Local, NaiveDateTime};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::aggregate::{Period, ReadingSet, aggregate, hourly_window, monthly_window};
use crate::client::{BulkOutcome, ClientError, PointtClient, TransientFetchError};
use crate::models::energy::{Recording, Window};
use crate::models::pointt::GatewayId;
use crate::shutdown::Shutdown;
use crate::tokens::{AuthError, TokenState};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Idle,
    Fetching,
    Aggregating,
    Published,
    Failed,
    AuthFailed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Published,
    Failed,
    AuthFailed,
    /// Another cycle was still running.
    Skipped,
    /// Shutdown interrupted the cycle; nothing was published.
    Cancelled,
}

/// What collaborators see between cycles.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub gateway_id: GatewayId,
    pub status: CycleStatus,
    pub readings: ReadingSet,
    pub last_published_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

enum Fetched {
    Recordings(Vec<Recording>),
    Failed(TransientFetchError),
}

enum Abort {
    Auth(AuthError),
    Cancelled,
}

/// Clears the in-cycle flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncCoordinator {
    client: PointtClient,
    gateway: GatewayId,
    in_cycle: AtomicBool,
    published: Mutex<Snapshot>,
}

impl SyncCoordinator {
    pub fn new(client: PointtClient, gateway: GatewayId) -> Self {
        let published = Snapshot {
            gateway_id: gateway.clone(),
            status: CycleStatus::Idle,
            readings: ReadingSet::new(),
            last_published_at: None,
            last_error: None,
        };
        SyncCoordinator {
            client,
            gateway,
            in_cycle: AtomicBool::new(false),
            published: Mutex::new(published),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: CycleStatus) {
        self.lock().status = status;
    }

    pub fn status(&self) -> CycleStatus {
        self.lock().status
    }

    pub fn readings(&self) -> ReadingSet {
        self.lock().readings.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    /// Current tokens, for persisting across restarts.
    pub fn token_state(&self) -> TokenState {
        self.client.tokens().snapshot()
    }

    /// Install new credentials; lifts an `AuthFailed` state.
    pub fn replace_credentials(&self, state: TokenState) {
        self.client.tokens().replace(state);
        let mut published = self.lock();
        if published.status == CycleStatus::AuthFailed {
            published.status = CycleStatus::Idle;
            published.last_error = None;
        }
        info!("Credentials replaced; sync cycles resume");
    }

    fn fetch(&self, window: Window) -> Result<Fetched, Abort> {
        match self.client.fetch_bulk_recordings(&self.gateway, window) {
            Ok(BulkOutcome::Recordings(recs)) => Ok(Fetched::Recordings(recs)),
            Ok(BulkOutcome::NoData) => Ok(Fetched::Recordings(Vec::new())),
            Err(ClientError::Transient(e)) => {
                warn!("Fetching {} failed: {}", window, e);
                Ok(Fetched::Failed(e))
            }
            Err(ClientError::Auth(e)) => Err(Abort::Auth(e)),
            Err(ClientError::Cancelled) => Err(Abort::Cancelled),
        }
    }

    /// Run one sync cycle as of local wall-clock time `now`.
    pub fn run_cycle(&self, now: NaiveDateTime) -> CycleOutcome {
        if self.status() == CycleStatus::AuthFailed {
            debug!("Skipping cycle: re-authentication required");
            return CycleOutcome::AuthFailed;
        }
        if self
            .in_cycle
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous sync cycle still running; skipping this tick");
            return CycleOutcome::Skipped;
        }
        let _guard = CycleGuard(&self.in_cycle);

        let previous = self.status();
        self.set_status(CycleStatus::Fetching);

        let fetched = [
            (Period::LastHour, hourly_window(now)),
            (Period::MonthToDate, monthly_window(now)),
        ]
        .into_iter()
        .map(|(period, window)| self.fetch(window).map(|f| (period, f)))
        .collect::<Result<Vec<_>, Abort>>();

        let fetched = match fetched {
            Ok(f) => f,
            Err(Abort::Auth(e)) => {
                error!("Authentication failed; re-authentication required: {}", e);
                let mut published = self.lock();
                published.status = CycleStatus::AuthFailed;
                published.last_error = Some(e.to_string());
                return CycleOutcome::AuthFailed;
            }
            Err(Abort::Cancelled) => {
                info!("Sync cycle cancelled by shutdown");
                self.set_status(previous);
                return CycleOutcome::Cancelled;
            }
        };

        let mut recordings = Vec::new();
        let mut refreshed = Vec::new();
        let mut failures = Vec::new();
        for (period, f) in fetched {
            match f {
                Fetched::Recordings(recs) => {
                    recordings.extend(recs);
                    refreshed.push(period);
                }
                Fetched::Failed(e) => failures.push(e.to_string()),
            }
        }

        if refreshed.is_empty() {
            let mut published = self.lock();
            published.status = CycleStatus::Failed;
            published.last_error = Some(failures.join("; "));
            return CycleOutcome::Failed;
        }

        self.set_status(CycleStatus::Aggregating);
        let computed = aggregate(&recordings, now);

        let mut published = self.lock();
        for (metric, reading) in computed {
            if refreshed.contains(&metric.period()) {
                published.readings.insert(metric, reading);
            }
        }
        published.last_published_at = Some(now);
        if failures.is_empty() {
            published.status = CycleStatus::Published;
            published.last_error = None;
            CycleOutcome::Published
        } else {
            published.status = CycleStatus::Failed;
            published.last_error = Some(failures.join("; "));
            CycleOutcome::Failed
        }
    }
}

/// Run a cycle every `interval` until `shutdown` fires, keeping a steady cadence.
pub fn run_loop(
    coordinator: &SyncCoordinator,
    interval: Duration,
    shutdown: &Shutdown,
    mut after_cycle: impl FnMut(&SyncCoordinator, CycleOutcome),
) {
    loop {
        let tick_start = Instant::now();

        let outcome = coordinator.run_cycle(Local::now().naive_local());
        match outcome {
            CycleOutcome::Cancelled => return,
            other => info!(
                "Sync cycle finished: {:?} (took {}ms)",
                other,
                tick_start.elapsed().as_millis()
            ),
        }
        after_cycle(coordinator, outcome);

        let elapsed = tick_start.elapsed();
        if elapsed < interval && shutdown.sleep(interval - elapsed).is_err() {
            return;
        }
        if shutdown.is_triggered() {
            return;
        }
    }
}
