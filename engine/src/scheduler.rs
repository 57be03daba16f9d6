//! Task scheduling for the synchronization engine
//!
//! One spawned ticker per enabled task sends the task id over a channel when
//! its interval fires; the scheduler's run loop receives ids and dispatches
//! runs onto the runtime so a slow transfer never blocks scheduling. The
//! store stays the authority for task state: every tick re-reads the task
//! before anything happens, which is also where stale run locks from crashed
//! processes get reclaimed. A separate ticker fires the daily trash
//! retention sweep at local midnight.

use crate::events::EventBus;
use crate::store::TaskStore;
use crate::transfer::TransferExecutor;
use anyhow::Result;
use shared::config::{Tunables, WardenSettings};
use shared::model::Task;
use shared::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Messages from the spawned tickers to the scheduler loop.
enum ScheduleSignal {
    /// A task's interval fired.
    TaskDue(i64),
    /// The daily trash retention sweep is due.
    TrashSweep,
}

/// Represents the possible states of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Handle to the ticker task driving one sync task's schedule.
struct TickerHandle {
    /// Interval the ticker was spawned with; a changed interval in the store
    /// means the ticker must be rebuilt.
    interval_minutes: u32,
    join_handle: tokio::task::JoinHandle<()>,
}

/// Manages the timers for all enabled tasks and dispatches due runs.
pub struct SyncScheduler {
    store: Arc<RwLock<TaskStore>>,
    executor: TransferExecutor,
    events: EventBus,
    tunables: Arc<Tunables>,
    /// One entry per task id; the invariant is at most one ticker per task.
    tickers: HashMap<i64, TickerHandle>,
    signal_receiver: mpsc::Receiver<ScheduleSignal>,
    signal_sender: mpsc::Sender<ScheduleSignal>,
    sweep_handle: Option<tokio::task::JoinHandle<()>>,
    /// Number of runs currently executing, for graceful shutdown.
    in_flight: Arc<AtomicUsize>,
    pub state: SchedulerState,
    graceful_shutdown_timeout_secs: u64,
    reconcile_interval_secs: u64,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<RwLock<TaskStore>>,
        executor: TransferExecutor,
        events: EventBus,
        tunables: Arc<Tunables>,
        settings: &WardenSettings,
    ) -> Self {
        let (signal_sender, signal_receiver) = mpsc::channel(settings.channel_buffer_size);
        Self {
            store,
            executor,
            events,
            tunables,
            tickers: HashMap::new(),
            signal_receiver,
            signal_sender,
            sweep_handle: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            state: SchedulerState::Stopped,
            graceful_shutdown_timeout_secs: settings.graceful_shutdown_timeout_seconds,
            reconcile_interval_secs: settings.reconcile_interval_seconds,
        }
    }

    /// Start one ticker per enabled task plus the daily sweep ticker.
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting sync scheduler");

        let tasks = self.store.write().await.list_enabled_tasks().await?;
        for task in &tasks {
            self.start_task_ticker(task);
        }
        self.spawn_sweep_ticker();

        self.state = SchedulerState::Running;
        info!("Sync scheduler started with {} tasks", self.tickers.len());
        Ok(())
    }

    /// Spawn the interval ticker for one task. Idempotent: a task that
    /// already has a ticker keeps the one it has.
    pub fn start_task_ticker(&mut self, task: &Task) {
        if self.tickers.contains_key(&task.id) {
            return;
        }

        // Intervals are validated to be at least one minute; the timer
        // rejects a zero period outright.
        let period = Duration::from_secs(task.interval_minutes.max(1) as u64 * 60);
        // The first tick comes after one full period; ticks that pile up
        // while a run drags on are skipped, not replayed.
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let sender = self.signal_sender.clone();
        let task_id = task.id;
        let join_handle = tokio::spawn(async move {
            loop {
                interval.tick().await;
                if sender.send(ScheduleSignal::TaskDue(task_id)).await.is_err() {
                    debug!("Ticker for task {} stopping, channel closed", task_id);
                    break;
                }
            }
        });

        debug!(
            "Started ticker for task {} every {} minutes",
            task.id, task.interval_minutes
        );
        self.tickers.insert(
            task.id,
            TickerHandle {
                interval_minutes: task.interval_minutes,
                join_handle,
            },
        );
    }

    /// Drop the ticker for a task, if any.
    pub fn stop_task_ticker(&mut self, task_id: i64) {
        if let Some(handle) = self.tickers.remove(&task_id) {
            handle.join_handle.abort();
            debug!("Stopped ticker for task {}", task_id);
        }
    }

    /// Stop and, when the task is still enabled, restart a task's ticker.
    /// Used after updates so interval changes take effect.
    pub async fn restart_task_ticker(&mut self, task_id: i64) -> Result<()> {
        self.stop_task_ticker(task_id);
        let task = match self.store.write().await.get_task(task_id).await {
            Ok(task) => task,
            Err(_) => return Ok(()),
        };
        if task.enabled {
            self.start_task_ticker(&task);
        }
        Ok(())
    }

    /// Number of live tickers.
    pub fn ticker_count(&self) -> usize {
        self.tickers.len()
    }

    pub fn has_ticker(&self, task_id: i64) -> bool {
        self.tickers.contains_key(&task_id)
    }

    fn spawn_sweep_ticker(&mut self) {
        if let Some(previous) = self.sweep_handle.take() {
            previous.abort();
        }
        let sender = self.signal_sender.clone();
        let handle = tokio::spawn(async move {
            loop {
                let wait = duration_until_next_midnight();
                debug!("Next trash sweep in {}s", wait.as_secs());
                tokio::time::sleep(wait).await;
                if sender.send(ScheduleSignal::TrashSweep).await.is_err() {
                    break;
                }
                // Step past the midnight boundary before recomputing.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        self.sweep_handle = Some(handle);
    }

    /// The scheduler's main loop. Runs until the state leaves `Running` or
    /// the caller drops the future.
    pub async fn run(&mut self) -> Result<()> {
        let mut reconcile =
            tokio::time::interval(Duration::from_secs(self.reconcile_interval_secs.max(1)));
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval tick fires immediately; consume it so the loop
        // starts by waiting.
        reconcile.tick().await;

        while self.state == SchedulerState::Running {
            tokio::select! {
                signal = self.signal_receiver.recv() => {
                    match signal {
                        Some(ScheduleSignal::TaskDue(task_id)) => self.dispatch_due_task(task_id).await,
                        Some(ScheduleSignal::TrashSweep) => self.dispatch_trash_sweep(),
                        None => break,
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!("Scheduler reconcile failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Handle one due tick for a task.
    pub(crate) async fn dispatch_due_task(&mut self, task_id: i64) {
        // Re-read the task; timers hold no task state beyond the handle.
        let task_result = self.store.write().await.get_task(task_id).await;
        let task = match task_result {
            Ok(task) => task,
            Err(_) => {
                debug!("Task {} is gone, dropping its timer", task_id);
                self.stop_task_ticker(task_id);
                return;
            }
        };
        if !task.enabled {
            debug!("Task {} is disabled, dropping its timer", task_id);
            self.stop_task_ticker(task_id);
            return;
        }

        if task.is_running {
            let started = task.started_at.unwrap_or(0);
            let age = current_timestamp().saturating_sub(started);
            if age > self.tunables.stale_task_threshold_secs as i64 {
                warn!(
                    "Task {} has held its run lock for {}s, force releasing",
                    task_id, age
                );
                if let Err(e) = self.store.write().await.release_lock(task_id).await {
                    warn!("Failed to release stale lock for task {}: {}", task_id, e);
                    return;
                }
                self.events.task_update();
                // Fall through and run this tick.
            } else {
                debug!("Task {} is still running, skipping this tick", task_id);
                return;
            }
        }

        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            match executor.execute_sync(task_id).await {
                Ok(outcome) => debug!(
                    "Scheduled run for task {} finished (success={})",
                    task_id, outcome.success
                ),
                Err(e) => warn!("Scheduled run for task {} did not complete: {}", task_id, e),
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn dispatch_trash_sweep(&mut self) {
        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = executor.sweep_trash().await {
                warn!("Trash retention sweep failed: {}", e);
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Bring the ticker map in line with the store. Picks up tasks created,
    /// deleted, retimed, or toggled by another process sharing the database.
    pub async fn reconcile(&mut self) -> Result<()> {
        let tasks = self.store.write().await.list_enabled_tasks().await?;
        let desired: HashMap<i64, u32> = tasks
            .iter()
            .map(|task| (task.id, task.interval_minutes))
            .collect();

        let current_ids: Vec<i64> = self.tickers.keys().copied().collect();
        for task_id in current_ids {
            match desired.get(&task_id) {
                None => self.stop_task_ticker(task_id),
                Some(interval) if *interval != self.tickers[&task_id].interval_minutes => {
                    self.stop_task_ticker(task_id)
                }
                _ => {}
            }
        }
        for task in &tasks {
            self.start_task_ticker(task);
        }
        Ok(())
    }

    /// Graceful shutdown: wait for in-flight runs up to the configured
    /// deadline, then drop all tickers.
    pub async fn stop(&mut self) {
        info!("Stopping sync scheduler");
        self.state = SchedulerState::Stopped;

        let deadline =
            Instant::now() + Duration::from_secs(self.graceful_shutdown_timeout_secs);
        let mut check_interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            check_interval.tick().await;
            let still_running = self.in_flight.load(Ordering::SeqCst);
            if still_running == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Graceful shutdown timeout reached, {} runs still in flight",
                    still_running
                );
                break;
            }
        }

        let ticker_count = self.tickers.len();
        for (_, handle) in self.tickers.drain() {
            handle.join_handle.abort();
        }
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
        debug!("Aborted {} tickers", ticker_count);
        info!("Sync scheduler stopped");
    }
}

/// Time remaining until the next local midnight.
fn duration_until_next_midnight() -> Duration {
    let now = chrono::Local::now();
    let Some(tomorrow) = now.date_naive().succ_opt() else {
        return Duration::from_secs(24 * 3600);
    };
    let Some(midnight) = tomorrow.and_hms_opt(0, 0, 0) else {
        return Duration::from_secs(24 * 3600);
    };
    match midnight.and_local_timezone(chrono::Local).earliest() {
        Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(60)),
        None => Duration::from_secs(24 * 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_midnight_is_within_a_day() {
        let wait = duration_until_next_midnight();
        assert!(wait > Duration::from_secs(0));
        assert!(wait <= Duration::from_secs(24 * 3600));
    }
}
