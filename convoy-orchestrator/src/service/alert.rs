//! Alert Service
//!
//! Opens, deduplicates and closes operator alerts. The public entry points
//! are fire-and-forget: they spawn the work and return its handle, and
//! every failure is logged inside the spawned task.

use chrono::Utc;
use convoy_core::domain::alert::{Alert, AlertPayload, AlertType, GLOBAL_APP_ID};
use convoy_core::domain::task::Task;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RepositoryResult, RoutingError};
use crate::notification::{NotificationRule, NotificationSender, rules_for};
use crate::repository::{AlertFilter, AlertRepository};
use crate::service::routing::RoutingEngine;

/// Bounds of one retention sweep
#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub fetch_limit: usize,
    pub delete_batch: usize,
    pub budget: Duration,
    pub pause: Duration,
}

impl SweepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_limit: config.alert_sweep_fetch_limit,
            delete_batch: config.alert_sweep_delete_batch,
            budget: config.alert_sweep_budget,
            pause: config.alert_sweep_pause,
        }
    }
}

#[derive(Clone)]
pub struct AlertService {
    alerts: Arc<dyn AlertRepository>,
    routing: RoutingEngine,
    notifier: Arc<dyn NotificationSender>,
    rules: Arc<Vec<NotificationRule>>,
    sweep: SweepSettings,
}

impl AlertService {
    pub fn new(
        alerts: Arc<dyn AlertRepository>,
        routing: RoutingEngine,
        notifier: Arc<dyn NotificationSender>,
        rules: Vec<NotificationRule>,
        sweep: SweepSettings,
    ) -> Self {
        Self {
            alerts,
            routing,
            notifier,
            rules: Arc::new(rules),
            sweep,
        }
    }

    /// Opens an alert unless a matching one is already open
    pub fn open_alert(
        &self,
        account_id: &str,
        app_id: &str,
        payload: AlertPayload,
    ) -> JoinHandle<()> {
        let service = self.clone();
        let account_id = account_id.to_string();
        let app_id = app_id.to_string();

        tokio::spawn(async move {
            let alert_type = payload.alert_type();
            if let Err(e) = service
                .find_or_open_alert(&account_id, &app_id, payload)
                .await
            {
                tracing::error!(
                    "Failed to open {} alert for account {} app {}: {}",
                    alert_type.as_str(),
                    account_id,
                    app_id,
                    e
                );
            }
        })
    }

    /// Closes the open alert matching the payload, if any
    pub fn close_alert(
        &self,
        account_id: &str,
        app_id: &str,
        payload: AlertPayload,
    ) -> JoinHandle<()> {
        let service = self.clone();
        let account_id = account_id.to_string();
        let app_id = app_id.to_string();

        tokio::spawn(async move {
            let alert_type = payload.alert_type();
            if let Err(e) = service
                .close_matching_alert(&account_id, &app_id, &payload)
                .await
            {
                tracing::error!(
                    "Failed to close {} alert for account {} app {}: {}",
                    alert_type.as_str(),
                    account_id,
                    app_id,
                    e
                );
            }
        })
    }

    /// Heals worker-availability alerts after a worker registered or heartbeated
    pub fn active_worker_updated(&self, account_id: &str, worker_id: &str) -> JoinHandle<()> {
        let service = self.clone();
        let account_id = account_id.to_string();
        let worker_id = worker_id.to_string();

        tokio::spawn(async move {
            if let Err(e) = service
                .reconcile_worker_alerts(&account_id, &worker_id)
                .await
            {
                tracing::error!(
                    "Failed to reconcile alerts for worker {} in account {}: {}",
                    worker_id,
                    account_id,
                    e
                );
            }
        })
    }

    /// Closes the actionable alerts of a finished execution
    pub fn deployment_completed(&self, app_id: &str, execution_id: Uuid) -> JoinHandle<()> {
        let service = self.clone();
        let app_id = app_id.to_string();

        tokio::spawn(async move {
            if let Err(e) = service
                .close_execution_alerts(&app_id, execution_id)
                .await
            {
                tracing::error!(
                    "Failed to close alerts of execution {} in app {}: {}",
                    execution_id,
                    app_id,
                    e
                );
            }
        })
    }

    /// Raises the alert explaining why a task found no worker
    pub fn task_unassignable(&self, task: Task) -> JoinHandle<()> {
        let service = self.clone();

        tokio::spawn(async move {
            let account_id = task.account_id.clone();
            let task_id = task.id;
            let payload = match service.routing.active_workers(&account_id).await {
                Ok(active) if active.is_empty() => AlertPayload::NoActiveWorkers {
                    account_id: account_id.clone(),
                },
                Ok(_) => AlertPayload::NoEligibleWorkers { task },
                Err(e) => {
                    tracing::error!(
                        "Failed to list active workers of account {} for task {}: {}",
                        account_id,
                        task_id,
                        e
                    );
                    return;
                }
            };

            if let Err(e) = service
                .find_or_open_alert(&account_id, GLOBAL_APP_ID, payload)
                .await
            {
                tracing::error!(
                    "Failed to raise alert for task {} in account {}: {}",
                    task_id,
                    account_id,
                    e
                );
            }
        })
    }

    /// Opens an alert and returns it, or returns `None` if a match is already open
    pub async fn find_or_open_alert(
        &self,
        account_id: &str,
        app_id: &str,
        payload: AlertPayload,
    ) -> RepositoryResult<Option<Alert>> {
        let filter = AlertFilter::for_alert(account_id, app_id);
        let existing = self.alerts.find_open(&filter, payload.alert_type()).await?;

        if existing.iter().any(|a| a.payload.matches(&payload)) {
            tracing::debug!(
                "{} alert already open for account {} app {}",
                payload.alert_type().as_str(),
                account_id,
                app_id
            );
            return Ok(None);
        }

        let alert = Alert::open(account_id, app_id, payload);
        self.alerts.insert(&alert).await?;
        tracing::info!(
            "Alert {} opened: {} (account {}, app {})",
            alert.id,
            alert.title,
            account_id,
            app_id
        );

        let rules = rules_for(&self.rules, alert.category);
        if !rules.is_empty() {
            self.notifier.send(&alert.title, &rules).await;
        }

        Ok(Some(alert))
    }

    /// Closes open alerts matching the payload
    ///
    /// Returns the number of alerts closed; zero is not an error.
    pub async fn close_matching_alert(
        &self,
        account_id: &str,
        app_id: &str,
        payload: &AlertPayload,
    ) -> RepositoryResult<usize> {
        let filter = AlertFilter::for_alert(account_id, app_id);
        let open = self.alerts.find_open(&filter, payload.alert_type()).await?;

        let mut closed = 0;
        for alert in open.iter().filter(|a| a.payload.matches(payload)) {
            if self.alerts.close(alert.id, Utc::now()).await? {
                tracing::info!("Alert {} closed: {}", alert.id, alert.title);
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Closes the account's "no active workers" alert and every "no eligible
    /// workers" alert whose task the worker can now run
    pub async fn reconcile_worker_alerts(
        &self,
        account_id: &str,
        worker_id: &str,
    ) -> Result<usize, RoutingError> {
        let mut closed = self
            .close_matching_alert(
                account_id,
                GLOBAL_APP_ID,
                &AlertPayload::NoActiveWorkers {
                    account_id: account_id.to_string(),
                },
            )
            .await?;

        let blocked = self
            .alerts
            .find_open(&AlertFilter::account(account_id), AlertType::NoEligibleWorkers)
            .await?;

        for alert in blocked {
            let AlertPayload::NoEligibleWorkers { task } = &alert.payload else {
                continue;
            };

            match self.routing.can_assign(account_id, worker_id, task).await {
                Ok(true) => {
                    if self.alerts.close(alert.id, Utc::now()).await? {
                        tracing::info!(
                            "Alert {} closed: worker {} can run task {}",
                            alert.id,
                            worker_id,
                            task.id
                        );
                        closed += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::error!(
                    "Failed to re-evaluate alert {} against worker {} in account {}: {}",
                    alert.id,
                    worker_id,
                    account_id,
                    e
                ),
            }
        }

        Ok(closed)
    }

    /// Closes approval and manual-intervention alerts raised by an execution
    pub async fn close_execution_alerts(
        &self,
        app_id: &str,
        execution_id: Uuid,
    ) -> RepositoryResult<usize> {
        let mut closed = 0;
        for alert_type in [AlertType::ApprovalNeeded, AlertType::ManualInterventionNeeded] {
            let open = self
                .alerts
                .find_open(&AlertFilter::app(app_id), alert_type)
                .await?;

            for alert in open
                .iter()
                .filter(|a| a.payload.execution_id() == Some(execution_id))
            {
                if self.alerts.close(alert.id, Utc::now()).await? {
                    closed += 1;
                }
            }
        }

        if closed > 0 {
            tracing::info!(
                "Closed {} alerts of completed execution {} in app {}",
                closed,
                execution_id,
                app_id
            );
        }
        Ok(closed)
    }

    /// Deletes closed alerts older than `retention`
    ///
    /// Runs in rounds of `fetch_limit` ids until a round comes back short or
    /// the time budget runs out. Never fails; returns the number deleted.
    pub async fn delete_old_alerts(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(7));
        let settings = self.sweep;
        let mut deleted = 0usize;

        let sweep = async {
            loop {
                let ids = match self
                    .alerts
                    .find_closed_before(cutoff, settings.fetch_limit)
                    .await
                {
                    Ok(ids) => ids,
                    Err(e) => {
                        tracing::error!("Failed to fetch closed alerts before {}: {}", cutoff, e);
                        return;
                    }
                };
                let drained = ids.len() < settings.fetch_limit;

                for batch in ids.chunks(settings.delete_batch.max(1)) {
                    match self.alerts.delete_by_ids(batch).await {
                        Ok(n) => deleted += n as usize,
                        Err(e) => tracing::error!(
                            "Failed to delete batch of {} closed alerts: {}",
                            batch.len(),
                            e
                        ),
                    }
                }

                if drained {
                    return;
                }
                tokio::time::sleep(settings.pause).await;
            }
        };

        if tokio::time::timeout(settings.budget, sweep).await.is_err() {
            tracing::warn!(
                "Alert retention sweep stopped after {:?} budget",
                settings.budget
            );
        }

        tracing::info!("Alert retention sweep deleted {} alerts", deleted);
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use crate::service::routing::tests::{scope, task, worker};
    use async_trait::async_trait;
    use chrono::DateTime;
    use convoy_core::domain::alert::{AlertCategory, AlertStatus};
    use convoy_core::domain::worker::TaskGroup;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, Vec<NotificationRule>)>>,
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(&self, message: &str, rules: &[NotificationRule]) {
            self.sent
                .lock()
                .unwrap()
                .push((message.to_string(), rules.to_vec()));
        }
    }

    fn settings() -> SweepSettings {
        SweepSettings {
            fetch_limit: 4,
            delete_batch: 2,
            budget: Duration::from_secs(5),
            pause: Duration::from_millis(1),
        }
    }

    fn service(store: &InMemoryStore, sender: Arc<RecordingSender>) -> AlertService {
        let routing = RoutingEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Duration::from_secs(315),
            Duration::from_secs(6 * 60 * 60),
        );
        AlertService::new(
            Arc::new(store.clone()),
            routing,
            sender,
            vec![NotificationRule::new(
                AlertCategory::Setup,
                vec!["ops".to_string()],
            )],
            settings(),
        )
    }

    fn open_alerts(store: &InMemoryStore) -> Vec<Alert> {
        store
            .alerts()
            .into_iter()
            .filter(|a| a.status == AlertStatus::Open)
            .collect()
    }

    #[tokio::test]
    async fn test_open_alert_twice_yields_one_open_alert() {
        let store = InMemoryStore::new();
        let sender = Arc::new(RecordingSender::default());
        let service = service(&store, sender.clone());
        let payload = AlertPayload::NoEligibleWorkers { task: task("acct1") };

        service
            .open_alert("acct1", GLOBAL_APP_ID, payload.clone())
            .await
            .unwrap();
        service
            .open_alert("acct1", GLOBAL_APP_ID, payload)
            .await
            .unwrap();

        assert_eq!(open_alerts(&store).len(), 1);
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_global_alerts_are_deduplicated_per_account() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));
        let mut t = task("acct1");

        service
            .find_or_open_alert("acct1", GLOBAL_APP_ID, AlertPayload::NoEligibleWorkers { task: t.clone() })
            .await
            .unwrap();
        t.account_id = "acct2".to_string();
        let second = service
            .find_or_open_alert("acct2", GLOBAL_APP_ID, AlertPayload::NoEligibleWorkers { task: t })
            .await
            .unwrap();

        assert!(second.is_some());
        assert_eq!(open_alerts(&store).len(), 2);
    }

    #[tokio::test]
    async fn test_close_absent_alert_is_noop() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));

        service
            .close_alert(
                "acct1",
                GLOBAL_APP_ID,
                AlertPayload::NoActiveWorkers {
                    account_id: "acct1".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(store.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_close_alert_stamps_closed_at() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));
        let payload = AlertPayload::NoActiveWorkers {
            account_id: "acct1".to_string(),
        };

        service
            .find_or_open_alert("acct1", GLOBAL_APP_ID, payload.clone())
            .await
            .unwrap();
        assert_eq!(
            service
                .close_matching_alert("acct1", GLOBAL_APP_ID, &payload)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            service
                .close_matching_alert("acct1", GLOBAL_APP_ID, &payload)
                .await
                .unwrap(),
            0
        );

        let alerts = store.alerts();
        assert_eq!(alerts[0].status, AlertStatus::Closed);
        assert!(alerts[0].closed_at.is_some());
    }

    #[tokio::test]
    async fn test_active_worker_updated_heals_blocked_task() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));

        let t1 = task("acct1");
        service
            .find_or_open_alert("acct1", GLOBAL_APP_ID, AlertPayload::NoEligibleWorkers { task: t1 })
            .await
            .unwrap();
        service
            .find_or_open_alert(
                "acct1",
                GLOBAL_APP_ID,
                AlertPayload::NoActiveWorkers {
                    account_id: "acct1".to_string(),
                },
            )
            .await
            .unwrap();

        let mut w2 = worker("w2", "acct1");
        let mut deploy = scope("deploy");
        deploy.task_groups = vec![TaskGroup::Deploy];
        w2.include_scopes.push(deploy);
        store.put_worker(w2);

        service
            .active_worker_updated("acct1", "w2")
            .await
            .unwrap();

        assert!(open_alerts(&store).is_empty());
    }

    #[tokio::test]
    async fn test_active_worker_updated_keeps_alert_for_unfit_worker() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));

        service
            .find_or_open_alert(
                "acct1",
                GLOBAL_APP_ID,
                AlertPayload::NoEligibleWorkers { task: task("acct1") },
            )
            .await
            .unwrap();

        let mut w3 = worker("w3", "acct1");
        let mut helm = scope("helm");
        helm.task_groups = vec![TaskGroup::Helm];
        w3.include_scopes.push(helm);
        store.put_worker(w3);

        assert_eq!(
            service.reconcile_worker_alerts("acct1", "w3").await.unwrap(),
            0
        );
        assert_eq!(open_alerts(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_deployment_completed_closes_execution_alerts() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));
        let finished = Uuid::new_v4();
        let running = Uuid::new_v4();

        for (approval_id, execution_id) in [("ap1", finished), ("ap2", running)] {
            service
                .find_or_open_alert(
                    "acct1",
                    "app1",
                    AlertPayload::ApprovalNeeded {
                        approval_id: approval_id.to_string(),
                        execution_id,
                        name: "Release".to_string(),
                    },
                )
                .await
                .unwrap();
        }
        service
            .find_or_open_alert(
                "acct1",
                "app1",
                AlertPayload::ManualIntervention {
                    state_execution_instance_id: Uuid::new_v4(),
                    execution_id: finished,
                    name: "Rollback".to_string(),
                },
            )
            .await
            .unwrap();

        service
            .deployment_completed("app1", finished)
            .await
            .unwrap();

        let open = open_alerts(&store);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].payload.execution_id(), Some(running));
    }

    #[tokio::test]
    async fn test_task_unassignable_picks_alert_type() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));

        service.task_unassignable(task("acct1")).await.unwrap();
        assert_eq!(
            open_alerts(&store)[0].alert_type,
            AlertType::NoActiveWorkers
        );

        let mut picky = worker("w1", "acct1");
        let mut helm = scope("helm");
        helm.task_groups = vec![TaskGroup::Helm];
        picky.include_scopes.push(helm);
        store.put_worker(picky);

        service.task_unassignable(task("acct1")).await.unwrap();
        let types: Vec<_> = open_alerts(&store).iter().map(|a| a.alert_type).collect();
        assert!(types.contains(&AlertType::NoEligibleWorkers));
    }

    #[tokio::test]
    async fn test_delete_old_alerts_respects_retention() {
        let store = InMemoryStore::new();
        let service = service(&store, Arc::new(RecordingSender::default()));
        let retention = Duration::from_secs(7 * 24 * 60 * 60);

        let closed_alert = |days_ago: i64| {
            let mut alert = Alert::open(
                "acct1",
                GLOBAL_APP_ID,
                AlertPayload::NoActiveWorkers {
                    account_id: "acct1".to_string(),
                },
            );
            alert.status = AlertStatus::Closed;
            alert.closed_at = Some(Utc::now() - chrono::Duration::days(days_ago));
            alert
        };

        for _ in 0..9 {
            store.put_alert(closed_alert(10));
        }
        let recent = closed_alert(1);
        store.put_alert(recent.clone());
        let mut still_open = closed_alert(30);
        still_open.status = AlertStatus::Open;
        still_open.closed_at = None;
        store.put_alert(still_open.clone());

        assert_eq!(service.delete_old_alerts(retention).await, 9);

        let ids: Vec<_> = store.alerts().into_iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&recent.id));
        assert!(ids.contains(&still_open.id));
    }

    /// Store that always has another full page of expired alerts
    struct EndlessAlerts;

    #[async_trait]
    impl AlertRepository for EndlessAlerts {
        async fn find_open(
            &self,
            _filter: &AlertFilter,
            _alert_type: AlertType,
        ) -> RepositoryResult<Vec<Alert>> {
            Ok(vec![])
        }

        async fn insert(&self, _alert: &Alert) -> RepositoryResult<()> {
            Ok(())
        }

        async fn close(&self, _alert_id: Uuid, _closed_at: DateTime<Utc>) -> RepositoryResult<bool> {
            Ok(false)
        }

        async fn find_closed_before(
            &self,
            _cutoff: DateTime<Utc>,
            limit: usize,
        ) -> RepositoryResult<Vec<Uuid>> {
            Ok((0..limit).map(|_| Uuid::new_v4()).collect())
        }

        async fn delete_by_ids(&self, _ids: &[Uuid]) -> RepositoryResult<u64> {
            Err(crate::error::RepositoryError::corrupt("alert", "batch", "delete rejected"))
        }
    }

    #[tokio::test]
    async fn test_delete_old_alerts_stops_on_budget() {
        let store = InMemoryStore::new();
        let routing = RoutingEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Duration::from_secs(315),
            Duration::from_secs(6 * 60 * 60),
        );
        let service = AlertService::new(
            Arc::new(EndlessAlerts),
            routing,
            Arc::new(RecordingSender::default()),
            vec![],
            SweepSettings {
                fetch_limit: 10,
                delete_batch: 5,
                budget: Duration::from_millis(50),
                pause: Duration::from_millis(5),
            },
        );

        let deleted = tokio::time::timeout(
            Duration::from_secs(5),
            service.delete_old_alerts(Duration::from_secs(60)),
        )
        .await
        .expect("sweep must end on its own budget");
        assert_eq!(deleted, 0);
    }
}
