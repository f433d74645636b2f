// Booking Orchestrator: one background worker per run driving
// discovery -> selection -> booking cycles until the cap, a stop request,
// the upstream daily limit or the retry budget ends it.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    task::{AbortHandle, JoinError, JoinHandle},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    auth::AuthGuard,
    catalog::SlotCatalog,
    circuit_breaker::CircuitBreaker,
    config::{BookingConfig, ConfigStore},
    error::StartError,
    policy::PriorityPolicy,
    session::SessionStore,
    status::{format_elapsed, RunOutcome, RunState, StatusPublisher, StatusSnapshot},
    transactor::{BookingOutcome, BookingRecord, BookingTransactor, RejectReason},
    upstream::VenueApi,
    window::{Clock, SystemClock, TimeWindow},
};

// Pause after every booking attempt before the next candidate
const POST_ATTEMPT_PAUSE: Duration = Duration::from_secs(1);

struct Shared {
    api: Arc<dyn VenueApi>,
    config: Arc<ConfigStore>,
    session: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    run_state: AtomicU8,
    status: StatusPublisher,
}

// Handles for the current (or last) run
struct RunBundle {
    cancel: CancellationToken,
    // cancelled by the supervisor once the terminal snapshot is published
    finished: CancellationToken,
    worker: AbortHandle,
    supervisor: Option<JoinHandle<()>>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    run: Mutex<Option<RunBundle>>,
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn VenueApi>,
        config: Arc<ConfigStore>,
        session: Arc<SessionStore>,
    ) -> Self {
        Self::with_clock(api, config, session, Arc::new(SystemClock))
    }

    pub fn with_clock(
        api: Arc<dyn VenueApi>,
        config: Arc<ConfigStore>,
        session: Arc<SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                config,
                session,
                clock,
                run_state: AtomicU8::new(RunState::Idle.as_u8()),
                status: StatusPublisher::new(),
            }),
            run: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.shared.run_state.load(Ordering::SeqCst))
    }

    // Claim the run slot. Idle and Stopped (implicit reset) may start; anything active may not.
    fn claim(&self) -> Result<RunState, StartError> {
        let mut current = self.shared.run_state.load(Ordering::SeqCst);
        loop {
            let state = RunState::from_u8(current);
            if state.is_active() {
                return Err(StartError::AlreadyRunning);
            }
            match self.shared.run_state.compare_exchange(
                current,
                RunState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, previous: RunState) {
        self.shared
            .run_state
            .store(previous.as_u8(), Ordering::SeqCst);
    }

    pub async fn start_run(&self) -> Result<(), StartError> {
        let previous = self.claim()?;

        let config = self.shared.config.get();
        if let Err(err) = config.validate() {
            self.release(previous);
            warn!(error = %err, "start rejected: invalid config");
            self.shared.status.update(|s| {
                s.last_error = Some(err.to_string());
                s.last_status_line = "Configuration rejected".to_string();
            });
            return Err(StartError::InvalidConfig(err.to_string()));
        }

        let creds = self.shared.session.snapshot();
        let auth = AuthGuard::new(self.shared.api.clone()).check(&creds).await;
        if !auth.is_valid() {
            self.release(previous);
            warn!(reason = %auth, "start rejected: credentials expired");
            self.shared.status.update(|s| {
                s.last_error = Some(format!("credentials expired: {auth}"));
                s.last_status_line = StartError::AuthExpired.to_string();
            });
            return Err(StartError::AuthExpired);
        }

        let cancel = CancellationToken::new();
        {
            // Held across the swap so a concurrent reset cannot drop the new bundle
            let mut run = self.run.lock();
            // A previous run, if any, has fully finished; drop its handles.
            run.take();

            let now = self.shared.clock.now();
            self.shared.status.replace(StatusSnapshot::started(now));
            info!(
                date = %config.target_date_str(),
                windows = ?config.preferred_windows.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
                cap = config.reservation_cap,
                max_retries = config.max_retries,
                "booking run started"
            );

            let finished = CancellationToken::new();
            let worker = tokio::spawn(run_loop(self.shared.clone(), config, cancel.clone()));
            let abort = worker.abort_handle();

            let shared = self.shared.clone();
            let done = finished.clone();
            let supervisor = tokio::spawn(async move {
                let result = worker.await;
                shared.finish(result);
                done.cancel();
            });

            *run = Some(RunBundle {
                cancel: cancel.clone(),
                finished,
                worker: abort,
                supervisor: Some(supervisor),
            });
        }

        // stop_run raced the start and found no token to cancel
        if self.state() == RunState::Stopping {
            cancel.cancel();
        }
        Ok(())
    }

    // Idempotent. Only the first call on a running worker changes state.
    pub fn stop_run(&self) {
        let moved = self
            .shared
            .run_state
            .compare_exchange(
                RunState::Running.as_u8(),
                RunState::Stopping.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if moved {
            info!("stop requested");
            self.shared.status.update(|s| {
                if s.state == RunState::Running {
                    s.state = RunState::Stopping;
                    s.last_status_line = "Stopping...".to_string();
                }
            });
        }

        if let Some(bundle) = self.run.lock().as_ref() {
            bundle.cancel.cancel();
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let snapshot = self.shared.status.get();
        let mut view = StatusSnapshot::clone(&snapshot);
        view.elapsed = format_elapsed(view.elapsed_at(self.shared.clock.now()));
        view
    }

    // Return a finished run to Idle. Refused while a worker is active.
    pub fn reset(&self) -> Result<(), StartError> {
        // start_run installs its bundle under this lock, so the state checked
        // here cannot belong to a run whose handles are not in place yet.
        let mut run = self.run.lock();
        match self.state() {
            RunState::Idle => {}
            RunState::Stopped => {
                self.shared
                    .run_state
                    .compare_exchange(
                        RunState::Stopped.as_u8(),
                        RunState::Idle.as_u8(),
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .map_err(|_| StartError::AlreadyRunning)?;
            }
            RunState::Running | RunState::Stopping => return Err(StartError::AlreadyRunning),
        }
        run.take();
        self.shared.status.replace(StatusSnapshot::default());
        drop(run);
        info!("orchestrator reset to idle");
        Ok(())
    }

    // Resolves once the current run has published its terminal snapshot.
    pub async fn wait(&self) {
        let finished = self.run.lock().as_ref().map(|b| b.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    // Cancel the current run and wait up to `timeout` for it to wind down.
    // A worker that does not stop in time is aborted, which still goes through
    // the supervisor and leaves the orchestrator `Stopped`. Returns `true` when
    // the worker stopped on its own.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop_run();
        if tokio::time::timeout(timeout, self.wait()).await.is_ok() {
            return true;
        }

        warn!(timeout_ms = timeout.as_millis() as u64, "worker did not stop in time, aborting");
        let supervisor = {
            let mut guard = self.run.lock();
            let taken = guard.as_mut().and_then(|bundle| {
                bundle.worker.abort();
                bundle.supervisor.take()
            });
            taken
        };
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                error!(error = %err, "supervisor join failed");
            }
        }
        false
    }
}

impl Drop for Orchestrator {
    // A dropped orchestrator must not leave its worker running detached
    fn drop(&mut self) {
        if let Some(bundle) = self.run.get_mut().as_ref() {
            bundle.cancel.cancel();
        }
    }
}

impl Shared {
    fn publish(&self, edit: impl FnOnce(&mut StatusSnapshot)) {
        self.status.update(edit);
    }

    // Progress is published from the worker's own state in one swap, so
    // readers never see the retry count ahead of the records.
    fn publish_progress(&self, records: &[BookingRecord], retries: u32, line: String) {
        self.status.update(|s| {
            s.booking_records = records.to_vec();
            s.retry_count = retries;
            s.last_status_line = line;
        });
    }

    fn finish(&self, result: Result<RunOutcome, JoinError>) {
        let now = self.clock.now();
        match result {
            Ok(outcome) => {
                self.status.update(|s| {
                    s.outcome = Some(outcome);
                    s.last_status_line = outcome.summary(s.booking_records.len(), s.retry_count);
                    s.state = RunState::Stopped;
                    s.finished_at = Some(now);
                });
                info!(outcome = ?outcome, summary = %self.status.get().last_status_line, "booking run finished");
            }
            Err(err) => {
                let cause = if err.is_panic() {
                    format!("worker panicked: {err}")
                } else {
                    format!("worker cancelled: {err}")
                };
                error!(error = %cause, "booking run aborted");
                self.status.update(|s| {
                    s.outcome = Some(RunOutcome::Aborted);
                    s.last_status_line =
                        RunOutcome::Aborted.summary(s.booking_records.len(), s.retry_count);
                    s.last_error = Some(cause);
                    s.state = RunState::Stopped;
                    s.finished_at = Some(now);
                });
            }
        }
        self.run_state
            .store(RunState::Stopped.as_u8(), Ordering::SeqCst);
    }
}

// Interruptible wait. Returns true if the run was cancelled while waiting.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    config: Arc<BookingConfig>,
    cancel: CancellationToken,
) -> RunOutcome {
    let catalog = SlotCatalog::new(shared.api.clone());
    let transactor = BookingTransactor::new(shared.api.clone());
    let policy = PriorityPolicy::new(&config.preferred_windows);
    let mut breaker = CircuitBreaker::new(
        config.breaker_failure_threshold,
        Duration::from_secs(config.breaker_cooldown_secs),
    );

    let mut records: Vec<BookingRecord> = Vec::new();
    let mut retries: u32 = 0;

    loop {
        if records.len() >= config.reservation_cap {
            return RunOutcome::CapReached;
        }
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        if retries >= config.max_retries {
            return RunOutcome::RetriesExhausted;
        }

        let cycle = retries + 1;

        if !breaker.should_allow_call() {
            shared.publish(|s| s.last_status_line = format!("Cycle {cycle}: upstream cooling down"));
            if pause(&cancel, config.retry_interval()).await {
                return RunOutcome::Cancelled;
            }
            retries += 1;
            shared.publish_progress(&records, retries, format!("Cycle {cycle}: upstream cooling down"));
            continue;
        }

        // one credential snapshot per cycle
        let creds = shared.session.snapshot();
        let discovery = catalog
            .discover_detailed(&config, &creds, shared.clock.now())
            .await;

        if discovery.upstream_down() {
            breaker.fail();
        } else {
            breaker.success();
        }

        if discovery.session_expired() {
            warn!(cycle, "upstream reports an expired session");
            shared.publish(|s| s.last_error = Some("credentials expired".to_string()));
        } else if discovery.failures.is_empty() {
            shared.publish(|s| {
                if s.last_error.as_deref() == Some("credentials expired") {
                    s.last_error = None;
                }
            });
        }

        let booked: Vec<TimeWindow> = records.iter().map(|r| r.window.clone()).collect();
        let candidates = policy.select_candidates(&discovery.slots, &booked);

        if candidates.is_empty() {
            info!(cycle, "no bookable slots");
            shared.publish(|s| s.last_status_line = format!("Cycle {cycle}: no slots available"));
            if pause(&cancel, config.retry_interval()).await {
                return RunOutcome::Cancelled;
            }
            retries += 1;
            shared.publish_progress(&records, retries, format!("Cycle {cycle}: no slots available"));
            continue;
        }

        info!(cycle, candidates = candidates.len(), "attempting bookings");

        for slot in &candidates {
            if records.len() >= config.reservation_cap || cancel.is_cancelled() {
                break;
            }

            shared.publish(|s| s.last_status_line = format!("Booking {}", slot.label()));
            let outcome = transactor
                .book(slot, &config, &creds, &cancel, shared.clock.now())
                .await;

            match outcome {
                BookingOutcome::Confirmed(record) => {
                    let line = format!(
                        "Booked {} ({}/{})",
                        record.label,
                        records.len() + 1,
                        config.reservation_cap
                    );
                    records.push(record);
                    shared.publish_progress(&records, retries, line);
                }
                BookingOutcome::Rejected {
                    reason: RejectReason::DailyLimit,
                    message,
                } => {
                    info!(booked = records.len(), "daily reservation limit reached");
                    shared.publish_progress(
                        &records,
                        retries,
                        format!("Daily limit reached: {message}"),
                    );
                    return RunOutcome::DailyLimit;
                }
                BookingOutcome::Rejected { reason, .. } => {
                    shared.publish(|s| {
                        s.last_status_line = format!("{} rejected: {reason}", slot.label())
                    });
                }
                BookingOutcome::Transient(reason) => {
                    shared.publish(|s| {
                        s.last_status_line = format!("{} failed: {reason}", slot.label())
                    });
                }
            }

            if records.len() < config.reservation_cap && pause(&cancel, POST_ATTEMPT_PAUSE).await {
                return RunOutcome::Cancelled;
            }
        }

        retries += 1;
        shared.publish_progress(
            &records,
            retries,
            format!(
                "Cycle {cycle} done: {}/{} booked",
                records.len(),
                config.reservation_cap
            ),
        );

        if records.len() >= config.reservation_cap || retries >= config.max_retries {
            continue;
        }
        if pause(&cancel, config.retry_interval()).await {
            return RunOutcome::Cancelled;
        }
    }
}
