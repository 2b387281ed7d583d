//! Supervised per-instance workers.
//!
//! The scheduler owns one task and one cancellation token per enabled
//! instance. Every token is a child of the scheduler's root token, so
//! `shutdown` stops them all at once while `stop`/`restart` act on one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterRegistry, HuntMode, MediaAdapter};
use crate::config::{Config, InstanceSettings};
use crate::cycle::CycleState;
use crate::error::{HuntError, Result};
use crate::processing::run_cycle;
use crate::services::HuntServices;
use crate::store::run_blocking;

type WorkerKey = (String, String);

struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
    settings: InstanceSettings,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub service: String,
    pub instance: String,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub state: Option<CycleState>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StartReport {
    pub started: Vec<WorkerKey>,
    /// `(service, instance, reason)` for every instance that did not start.
    pub rejected: Vec<(String, String, String)>,
}

pub struct Scheduler {
    services: Arc<HuntServices>,
    adapters: AdapterRegistry,
    root: CancellationToken,
    workers: Mutex<HashMap<WorkerKey, WorkerHandle>>,
    sleep: Duration,
}

impl Scheduler {
    pub fn new(services: Arc<HuntServices>, adapters: AdapterRegistry) -> Self {
        let sleep = services.general.sleep_duration();
        Self {
            services,
            adapters,
            root: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
            sleep,
        }
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn services(&self) -> &Arc<HuntServices> {
        &self.services
    }

    /// Start a worker for every enabled instance. Invalid instances are
    /// reported in the result and never prevent the others from starting.
    pub fn start_all(&self, config: &Config) -> StartReport {
        let mut report = StartReport::default();
        for (service, instance, resolved) in config.resolve_enabled() {
            let started = resolved.and_then(|settings| self.spawn_worker(settings));
            match started {
                Ok(()) => report.started.push((service, instance)),
                Err(e) => {
                    warn!(service = %service, instance = %instance, error = %e, "instance not started");
                    report.rejected.push((service, instance, e.to_string()));
                }
            }
        }
        info!(
            started = report.started.len(),
            rejected = report.rejected.len(),
            "scheduler started"
        );
        report
    }

    /// Spawn the worker for `settings`. Fails with `AlreadyRunning` while a
    /// live worker holds the same instance; `restart` replaces one. Must run
    /// inside a tokio runtime.
    pub fn spawn_worker(&self, settings: InstanceSettings) -> Result<()> {
        let adapter = self
            .adapters
            .get(&settings.service)
            .cloned()
            .ok_or_else(|| {
                HuntError::invalid_config(
                    format!("{}/{}", settings.service, settings.instance_name),
                    "no adapter registered for this service",
                )
            })?;

        let key = (settings.service.clone(), settings.instance_name.clone());
        let mut workers = self.lock();
        if workers.get(&key).is_some_and(|w| !w.handle.is_finished()) {
            return Err(HuntError::AlreadyRunning {
                service: key.0,
                instance: key.1,
            });
        }
        self.services.tracker.register(&key.0, &key.1);

        let token = self.root.child_token();
        let handle = tokio::spawn(worker_loop(
            self.services.clone(),
            adapter,
            settings.clone(),
            token.clone(),
            self.sleep,
        ));
        workers.insert(
            key,
            WorkerHandle {
                token,
                handle,
                settings,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        let workers = self.lock();
        let mut out: Vec<WorkerInfo> = workers
            .iter()
            .map(|((service, instance), w)| WorkerInfo {
                service: service.clone(),
                instance: instance.clone(),
                running: !w.handle.is_finished(),
                started_at: w.started_at,
                state: self.services.tracker.get(service, instance),
            })
            .collect();
        out.sort_by(|a, b| (&a.service, &a.instance).cmp(&(&b.service, &b.instance)));
        out
    }

    /// Cancel one worker and wait for it to reach its next poll point.
    pub async fn stop(&self, service: &str, instance: &str) -> Result<()> {
        let worker = self
            .lock()
            .remove(&(service.to_string(), instance.to_string()))
            .ok_or_else(|| HuntError::NotConfigured {
                service: service.to_string(),
                instance: instance.to_string(),
            })?;
        worker.token.cancel();
        if let Err(e) = worker.handle.await {
            warn!(service, instance, error = %e, "worker ended abnormally");
        }
        self.services.tracker.unregister(service, instance);
        info!(service, instance, "worker stopped");
        Ok(())
    }

    pub async fn restart(&self, service: &str, instance: &str) -> Result<()> {
        let settings = self
            .lock()
            .get(&(service.to_string(), instance.to_string()))
            .map(|w| w.settings.clone())
            .ok_or_else(|| HuntError::NotConfigured {
                service: service.to_string(),
                instance: instance.to_string(),
            })?;
        self.stop(service, instance).await?;
        self.spawn_worker(settings)?;
        info!(service, instance, "worker restarted");
        Ok(())
    }

    /// Cancel every worker and wait for all of them.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<(WorkerKey, WorkerHandle)> = self.lock().drain().collect();
        for ((service, instance), worker) in drained {
            if let Err(e) = worker.handle.await {
                warn!(service = %service, instance = %instance, error = %e, "worker ended abnormally");
            }
            self.services.tracker.unregister(&service, &instance);
        }
        info!("scheduler shut down");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkerKey, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn worker_loop(
    services: Arc<HuntServices>,
    adapter: Arc<dyn MediaAdapter>,
    settings: InstanceSettings,
    token: CancellationToken,
    sleep: Duration,
) {
    let service = settings.service.as_str();
    let instance = settings.instance_name.as_str();
    let mut rng = StdRng::from_entropy();
    let wake = services
        .tracker
        .wake_handle(service, instance)
        .unwrap_or_else(|| Arc::new(Notify::new()));
    info!(service, instance, "worker started");

    loop {
        if token.is_cancelled() {
            break;
        }
        match services.tracker.begin_cycle(service, instance) {
            Ok(true) => info!(service, instance, "pending reset consumed"),
            Ok(false) => {}
            Err(e) => {
                warn!(service, instance, error = %e, "instance no longer tracked; worker exiting");
                break;
            }
        }
        let dedup = services.dedup.clone();
        let admission = services.admission.clone();
        let housekeeping = run_blocking(move || {
            Ok((
                dedup.sweep_expired(),
                admission.discard_stale_buckets(Utc::now()),
            ))
        })
        .await;
        match housekeeping {
            Ok((swept, discarded)) => {
                match swept {
                    Ok(0) => {}
                    Ok(n) => debug!(service, instance, removed = n, "expired processed records swept"),
                    Err(e) => warn!(service, instance, error = %e, "expiry sweep failed"),
                }
                if let Err(e) = discarded {
                    warn!(service, error = %e, "stale cap bucket cleanup failed");
                }
            }
            Err(e) => warn!(service, instance, error = %e, "housekeeping did not run"),
        }

        let stop = || token.is_cancelled();
        for mode in HuntMode::ALL {
            if mode.hunt_count(&settings) <= 0 {
                continue;
            }
            if stop() {
                break;
            }
            run_cycle(&services, adapter.as_ref(), &settings, mode, &stop, &mut rng).await;
        }

        let next = chrono::Duration::from_std(sleep)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        services.tracker.end_cycle(service, instance, next);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(sleep) => {}
            _ = wake.notified() => debug!(service, instance, "woken early by reset request"),
        }
    }

    info!(service, instance, "worker exiting");
}
