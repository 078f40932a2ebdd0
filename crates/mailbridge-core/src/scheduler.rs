//! Timer-driven POP3 fetch scheduler

use crate::account::Account;
use crate::config::FetchConfig;
use crate::database::Database;
use crate::ingest::{FetchOutcome, Pop3Fetcher};
use crate::progress::{Progress, ProgressStatus, ProgressStore};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Runs one account's fetch; `Pop3Fetcher` in production
#[async_trait]
pub trait AccountFetcher: Send + Sync {
    async fn fetch(
        &self,
        account: &Account,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> FetchOutcome;
}

#[async_trait]
impl AccountFetcher for Pop3Fetcher {
    async fn fetch(
        &self,
        account: &Account,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> FetchOutcome {
        self.fetch_account(account, on_progress).await
    }
}

type InFlight = Arc<Mutex<HashSet<i64>>>;

/// Membership in the in-flight set; released on drop, even if the run panics
struct InFlightGuard {
    set: InFlight,
    account_id: i64,
}

impl InFlightGuard {
    fn claim(set: &InFlight, account_id: i64) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(|p| p.into_inner());
        ids.insert(account_id).then(|| Self {
            set: Arc::clone(set),
            account_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(|p| p.into_inner());
        ids.remove(&self.account_id);
    }
}

/// Fetches every active account on a fixed interval, one run per account at a time
pub struct Scheduler {
    db: Arc<Database>,
    fetcher: Arc<dyn AccountFetcher>,
    progress: Arc<dyn ProgressStore>,
    config: FetchConfig,
    paused: AtomicBool,
    in_flight: InFlight,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn AccountFetcher>,
        progress: Arc<dyn ProgressStore>,
        config: FetchConfig,
    ) -> Self {
        Self {
            db,
            fetcher,
            progress,
            config,
            paused: AtomicBool::new(false),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pause(&self) {
        info!("Scheduler paused");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("Scheduler resumed");
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Progress of every account that has an entry
    pub fn progress(&self) -> Vec<Progress> {
        self.progress.snapshot()
    }

    pub fn progress_for(&self, account_id: i64) -> Option<Progress> {
        self.progress.get(account_id)
    }

    fn is_in_flight(&self, account_id: i64) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&account_id)
    }

    /// Tick until `shutdown` flips to true. Ticks are spawned, so a slow tick
    /// never delays the next one; the in-flight set keeps accounts from overlapping.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Scheduler started, fetching every {}s",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        scheduler.tick().await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// One scheduling pass; returns the number of messages delivered
    pub async fn tick(self: &Arc<Self>) -> usize {
        let accounts = match self.db.active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to load POP3 accounts: {}", e);
                self.log_sync(false, 0).await;
                return 0;
            }
        };

        if accounts.is_empty() {
            debug!("No POP3 accounts to fetch");
            return 0;
        }

        if self.is_paused() {
            // Finished entries keep their state until they expire
            let idle = accounts.iter().filter(|a| {
                !self.is_in_flight(a.id)
                    && !self
                        .progress
                        .get(a.id)
                        .is_some_and(|p| p.status.is_finished())
            });
            for account in idle {
                self.progress.update(Progress::new(
                    account.id,
                    account.label(),
                    ProgressStatus::Paused,
                ));
            }
            debug!("Scheduler paused, skipping tick");
            return 0;
        }

        info!("Fetching {} POP3 account(s)", accounts.len());

        let mut runs = Vec::with_capacity(accounts.len());
        for account in accounts {
            let Some(guard) = InFlightGuard::claim(&self.in_flight, account.id) else {
                debug!("{} is still being fetched, skipping", account.label());
                continue;
            };

            self.progress.update(Progress::new(
                account.id,
                account.label(),
                ProgressStatus::Waiting,
            ));

            let scheduler = Arc::clone(self);
            runs.push(tokio::spawn(async move {
                scheduler.run_account(account, guard).await
            }));
        }

        let mut total = 0;
        for result in join_all(runs).await {
            match result {
                Ok(outcome) => total += outcome.delivered,
                Err(e) => error!("Fetch task aborted: {}", e),
            }
        }

        info!("Tick complete, {} new message(s)", total);
        self.log_sync(true, total).await;
        total
    }

    /// Fetch one account right away. `None` if it is already mid-fetch.
    pub async fn fetch_now(self: &Arc<Self>, account_id: i64) -> CoreResult<Option<FetchOutcome>> {
        let account = self
            .db
            .get_account(account_id)
            .await?
            .ok_or(CoreError::AccountNotFound(account_id))?;

        let Some(guard) = InFlightGuard::claim(&self.in_flight, account_id) else {
            return Ok(None);
        };

        Ok(Some(self.run_account(account, guard).await))
    }

    async fn run_account(&self, account: Account, _guard: InFlightGuard) -> FetchOutcome {
        let account_id = account.id;
        let label = account.label();
        self.progress
            .update(Progress::new(account_id, &label, ProgressStatus::Fetching));

        let progress = Arc::clone(&self.progress);
        let running_label = label.clone();
        let on_progress = move |current: usize, total: usize| {
            progress.update(
                Progress::new(account_id, &running_label, ProgressStatus::Fetching)
                    .with_counts(current, total),
            );
        };

        let outcome = self.fetcher.fetch(&account, &on_progress).await;

        let status = if outcome.error.is_some() {
            ProgressStatus::Error
        } else {
            ProgressStatus::Done
        };
        let (current, total) = self
            .progress
            .get(account_id)
            .map(|p| (p.current, p.total))
            .unwrap_or((0, 0));
        self.progress
            .update(Progress::new(account_id, &label, status).with_counts(current, total));
        self.expire(account_id);

        outcome
    }

    /// Drop a finished entry after a short delay so the next tick's "waiting" shows
    fn expire(&self, account_id: i64) {
        let progress = Arc::clone(&self.progress);
        let delay = self.config.progress_expiry();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            progress.clear_if_finished(account_id);
        });
    }

    async fn log_sync(&self, success: bool, total: usize) {
        if let Err(e) = self.db.log_sync_event(success, total as i64).await {
            warn!("Failed to log sync event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MemoryProgress;
    use crate::testing::StubFetcher;
    use std::time::Duration;

    async fn scheduler_with(
        fetcher: Arc<StubFetcher>,
        users: &[&str],
        expiry_secs: u64,
    ) -> (Arc<Scheduler>, Arc<Database>, Vec<i64>) {
        let db = Arc::new(Database::open_memory().await.unwrap());
        let mut ids = Vec::new();
        for user in users {
            let account = Account::new("owner@corp.example", "pop.example.net", *user, "pw");
            ids.push(db.save_account(&account).await.unwrap());
        }

        let config = FetchConfig {
            progress_expiry_secs: expiry_secs,
            ..FetchConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            fetcher,
            Arc::new(MemoryProgress::new()),
            config,
        ));
        (scheduler, db, ids)
    }

    #[tokio::test]
    async fn test_tick_logs_one_aggregate_event() {
        let fetcher = Arc::new(StubFetcher::delivering(3).failing_for("bob"));
        let (scheduler, db, ids) =
            scheduler_with(fetcher.clone(), &["alice", "bob", "carol"], 60).await;

        let total = scheduler.tick().await;

        // bob fails after one message; partial deliveries still count
        assert_eq!(total, 7);
        assert_eq!(fetcher.calls(), 3);

        let events = db.recent_sync_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "SUCCESS");
        assert_eq!(events[0].emails_processed, 7);

        let statuses: Vec<ProgressStatus> = ids
            .iter()
            .map(|id| scheduler.progress_for(*id).unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![ProgressStatus::Done, ProgressStatus::Error, ProgressStatus::Done]
        );
        assert_eq!(scheduler.progress_for(ids[0]).unwrap().current, 3);
    }

    #[tokio::test]
    async fn test_running_account_is_not_fetched_twice() {
        let fetcher = Arc::new(StubFetcher::delivering(1).holding());
        let (scheduler, db, _ids) = scheduler_with(fetcher.clone(), &["alice"], 60).await;

        let first = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.tick().await })
        };
        fetcher.started.notified().await;

        // Tick N+1 while tick N's fetch is still running
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(fetcher.calls(), 1);

        fetcher.release.notify_one();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(db.recent_sync_events(10).await.unwrap().len(), 2);

        // The guard is released once the run settles
        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_paused_tick_only_marks_progress() {
        let fetcher = Arc::new(StubFetcher::delivering(1));
        let (scheduler, db, ids) = scheduler_with(fetcher.clone(), &["alice", "bob"], 60).await;

        scheduler.pause();
        assert!(scheduler.is_paused());
        assert_eq!(scheduler.tick().await, 0);

        assert_eq!(fetcher.calls(), 0);
        assert!(db.recent_sync_events(10).await.unwrap().is_empty());
        assert!(scheduler
            .progress()
            .iter()
            .all(|p| p.status == ProgressStatus::Paused));
        assert_eq!(scheduler.progress().len(), ids.len());

        scheduler.resume();
        assert_eq!(scheduler.tick().await, 2);
    }

    #[tokio::test]
    async fn test_paused_tick_keeps_finished_entries() {
        let fetcher = Arc::new(StubFetcher::delivering(2).failing_for("bob"));
        let (scheduler, _db, ids) =
            scheduler_with(fetcher.clone(), &["alice", "bob", "carol"], 60).await;
        scheduler.fetch_now(ids[0]).await.unwrap();
        scheduler.fetch_now(ids[1]).await.unwrap();

        scheduler.pause();
        scheduler.tick().await;

        let alice = scheduler.progress_for(ids[0]).unwrap();
        assert_eq!(alice.status, ProgressStatus::Done);
        assert_eq!(alice.current, 2);
        assert_eq!(
            scheduler.progress_for(ids[1]).unwrap().status,
            ProgressStatus::Error
        );
        assert_eq!(
            scheduler.progress_for(ids[2]).unwrap().status,
            ProgressStatus::Paused
        );
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_now_respects_in_flight() {
        let fetcher = Arc::new(StubFetcher::delivering(2).holding());
        let (scheduler, _db, ids) = scheduler_with(fetcher.clone(), &["alice"], 60).await;

        let running = {
            let scheduler = Arc::clone(&scheduler);
            let id = ids[0];
            tokio::spawn(async move { scheduler.fetch_now(id).await })
        };
        fetcher.started.notified().await;

        assert!(scheduler.fetch_now(ids[0]).await.unwrap().is_none());
        assert!(matches!(
            scheduler.fetch_now(9999).await,
            Err(CoreError::AccountNotFound(9999))
        ));

        fetcher.release.notify_one();
        let outcome = running.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.delivered, 2);
    }

    #[tokio::test]
    async fn test_finished_progress_expires() {
        let fetcher = Arc::new(StubFetcher::delivering(1));
        let (scheduler, _db, _ids) = scheduler_with(fetcher, &["alice"], 0).await;

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(scheduler.progress().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fetcher = Arc::new(StubFetcher::delivering(1));
        let (scheduler, _db, _ids) = scheduler_with(fetcher, &["alice"], 60).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
