//! One fetch → select → act pass for one instance and one hunt mode.
//!
//! Every failure inside a cycle degrades to "processed fewer items": a
//! failed fetch ends the cycle, a failed action skips the item, a store
//! error falls back to the permissive answer. Store calls run on the
//! blocking pool.

use std::collections::HashSet;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapter::{FetchFilters, HuntMode, MediaAdapter};
use crate::config::InstanceSettings;
use crate::history::HistoryEntry;
use crate::selection::{self, Candidate, SelectionConfig, SelectionStats};
use crate::services::HuntServices;
use crate::store::run_blocking;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Every selected item was attempted.
    Completed,
    /// Fetch or selection produced no work.
    NothingToDo,
    FetchFailed,
    Stopped,
    CapReached,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub mode: HuntMode,
    pub selection: SelectionStats,
    pub selected: usize,
    pub processed: usize,
    pub failed: usize,
    pub processed_any: bool,
    pub halt: HaltReason,
}

impl CycleReport {
    fn empty(mode: HuntMode, halt: HaltReason) -> Self {
        Self {
            mode,
            selection: SelectionStats::default(),
            selected: 0,
            processed: 0,
            failed: 0,
            processed_any: false,
            halt,
        }
    }
}

/// Run one cycle. `stop` is polled before the fetch and before each item.
pub async fn run_cycle<R>(
    services: &HuntServices,
    adapter: &dyn MediaAdapter,
    settings: &InstanceSettings,
    mode: HuntMode,
    stop: &(dyn Fn() -> bool + Send + Sync),
    rng: &mut R,
) -> CycleReport
where
    R: Rng + Send + ?Sized,
{
    let service = settings.service.as_str();
    let instance = settings.instance_name.as_str();

    if stop() {
        debug!(service, instance, %mode, "stop requested before fetch");
        return CycleReport::empty(mode, HaltReason::Stopped);
    }

    let filters = FetchFilters::new(settings, mode);
    let candidates = match adapter.fetch_eligible(settings, &filters).await {
        Ok(c) => c,
        Err(e) => {
            warn!(service, instance, %mode, error = %e, "candidate fetch failed");
            return CycleReport::empty(mode, HaltReason::FetchFailed);
        }
    };
    if candidates.is_empty() {
        info!(service, instance, %mode, "no eligible items reported");
        return CycleReport::empty(mode, HaltReason::NothingToDo);
    }

    let config = SelectionConfig::for_mode(settings, mode);
    let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
    let dedup = services.dedup.clone();
    let (svc, inst) = (service.to_string(), instance.to_string());
    let processed = run_blocking(move || dedup.processed_among(&svc, &inst, &ids, Utc::now()))
        .await
        .unwrap_or_else(|e| {
            warn!(service, instance, error = %e, "dedup lookup failed; treating items as new");
            HashSet::new()
        });
    let is_processed = |c: &Candidate| processed.contains(&c.id);
    let selection = selection::select(candidates, &config, Utc::now(), is_processed, rng);
    let stats = selection.stats.clone();
    debug!(
        service,
        instance,
        %mode,
        fetched = stats.fetched,
        future = stats.future,
        no_release_date = stats.no_release_date,
        delayed = stats.delayed,
        already_processed = stats.already_processed,
        eligible = stats.eligible,
        "selection done"
    );

    let mut report = CycleReport {
        selected: selection.len(),
        selection: stats,
        ..CycleReport::empty(mode, HaltReason::Completed)
    };
    if selection.is_empty() {
        info!(service, instance, %mode, "nothing left to process after filtering");
        report.halt = HaltReason::NothingToDo;
        return report;
    }

    for candidate in selection.items {
        if stop() {
            info!(service, instance, %mode, "stop requested; leaving remaining items");
            report.halt = HaltReason::Stopped;
            break;
        }
        let admission = services.admission.clone();
        let svc = service.to_string();
        let exceeded = run_blocking(move || admission.check_exceeded(&svc))
            .await
            .unwrap_or_else(|e| {
                warn!(service, error = %e, "cap check failed; allowing action");
                false
            });
        if exceeded {
            info!(service, instance, %mode, "hourly cap reached; ending cycle");
            report.halt = HaltReason::CapReached;
            break;
        }

        match adapter.act(settings, mode, &candidate.id).await {
            Ok(true) => {
                record_success(services, adapter, settings, mode, &candidate).await;
                report.processed += 1;
                report.processed_any = true;
            }
            Ok(false) => {
                warn!(service, instance, id = %candidate.id, "action declined by service");
                report.failed += 1;
            }
            Err(e) => {
                warn!(service, instance, id = %candidate.id, error = %e, "action failed");
                report.failed += 1;
            }
        }
    }

    info!(
        service,
        instance,
        %mode,
        selected = report.selected,
        processed = report.processed,
        failed = report.failed,
        halt = ?report.halt,
        "cycle finished"
    );
    report
}

async fn record_success(
    services: &HuntServices,
    adapter: &dyn MediaAdapter,
    settings: &InstanceSettings,
    mode: HuntMode,
    candidate: &Candidate,
) {
    let service = settings.service.as_str();
    let instance = settings.instance_name.as_str();

    let dedup = services.dedup.clone();
    let admission = services.admission.clone();
    let (svc, inst, id) = (
        service.to_string(),
        instance.to_string(),
        candidate.id.clone(),
    );
    let counts_against_budget = settings.counts_against_budget;
    let bookkeeping = run_blocking(move || {
        if let Err(e) = dedup.mark_processed(&svc, &inst, &id) {
            warn!(service = %svc, instance = %inst, id = %id, error = %e, "failed to mark processed");
        }
        if counts_against_budget {
            if let Err(e) = admission.increment(&svc) {
                warn!(service = %svc, error = %e, "failed to increment hourly cap");
            }
        }
        if let Err(e) = admission.increment_stat_only(&svc, mode.stat_kind()) {
            warn!(service = %svc, error = %e, "failed to record stat");
        }
        Ok(())
    })
    .await;
    if let Err(e) = bookkeeping {
        warn!(service, instance, id = %candidate.id, error = %e, "bookkeeping did not run");
    }

    if settings.tag_processed_items {
        let label = mode.tag_label(settings);
        if let Err(e) = adapter.tag(settings, &candidate.id, label).await {
            warn!(service, instance, id = %candidate.id, error = %e, "tagging failed");
        }
    }

    let history = services.history.clone();
    let entry = HistoryEntry::new(service, instance, &candidate.media_label(), &candidate.id, mode);
    let recorded = run_blocking(move || {
        history.record(entry);
        Ok(())
    })
    .await;
    if let Err(e) = recorded {
        warn!(service, instance, id = %candidate.id, error = %e, "history not recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{released, services_tmp, settings, MockAdapter};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(11)
    }

    fn never() -> impl Fn() -> bool + Send + Sync {
        || false
    }

    #[tokio::test]
    async fn processes_selected_items_and_records_outcome() {
        let (_dir, services, history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(10));
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert!(report.processed_any);
        assert_eq!(report.processed, 3);
        assert_eq!(report.halt, HaltReason::Completed);
        assert_eq!(adapter.act_count(), 3);
        for id in adapter.acted() {
            assert!(services.dedup.is_processed("radarr", "Main", &id).unwrap());
        }
        assert_eq!(services.admission.usage("radarr").unwrap().count, 3);
        assert_eq!(services.admission.stats().unwrap()["radarr"]["upgraded"], 3);
        assert_eq!(history.len(), 3);
        let tagged = adapter.tagged.lock().unwrap().clone();
        assert_eq!(tagged.len(), 3);
        assert!(tagged.iter().all(|(_, label)| label == "huntarr-upgraded"));
    }

    #[tokio::test]
    async fn cap_at_limit_halts_without_acting() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        services.admission.set_limit("radarr", 2);
        services.admission.increment("radarr").unwrap();
        services.admission.increment("radarr").unwrap();
        let adapter = MockAdapter::with_candidates(released(5));
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert!(!report.processed_any);
        assert_eq!(report.halt, HaltReason::CapReached);
        assert_eq!(report.selected, 3);
        assert_eq!(adapter.act_count(), 0);
    }

    #[tokio::test]
    async fn cap_reached_mid_cycle_stops_remaining() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        services.admission.set_limit("radarr", 2);
        let adapter = MockAdapter::with_candidates(released(10));
        let s = settings("radarr", "Main", 5);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.halt, HaltReason::CapReached);
        assert_eq!(adapter.act_count(), 2);
    }

    #[tokio::test]
    async fn stop_before_first_item_acts_on_nothing() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(5));
        let s = settings("radarr", "Main", 5);

        // Allow the pre-fetch poll, then stop at the first item.
        let polls = AtomicUsize::new(0);
        let stop = move || polls.fetch_add(1, Ordering::SeqCst) >= 1;
        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &stop, &mut rng()).await;

        assert_eq!(report.halt, HaltReason::Stopped);
        assert_eq!(adapter.act_count(), 0);
        for c in released(5) {
            assert!(!services.dedup.is_processed("radarr", "Main", &c.id).unwrap());
        }
    }

    #[tokio::test]
    async fn stop_before_fetch_skips_fetch() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(5));
        let s = settings("radarr", "Main", 5);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &|| true, &mut rng()).await;

        assert_eq!(report.halt, HaltReason::Stopped);
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn processed_items_not_reselected_within_window() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(4));
        let s = settings("radarr", "Main", 2);
        let mut rng = rng();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng).await;
            assert_eq!(report.processed, 2);
        }
        seen.extend(adapter.acted());
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 4, "an item was acted on twice");

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng).await;
        assert_eq!(report.halt, HaltReason::NothingToDo);
        assert_eq!(report.selection.already_processed, 4);
    }

    #[tokio::test]
    async fn fetch_failure_ends_cycle() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(3));
        adapter.fail_fetch.store(true, Ordering::SeqCst);
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.halt, HaltReason::FetchFailed);
        assert!(!report.processed_any);
    }

    #[tokio::test]
    async fn empty_fetch_is_nothing_to_do() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter = MockAdapter::default();
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.halt, HaltReason::NothingToDo);
        assert_eq!(report.selected, 0);
    }

    #[tokio::test]
    async fn failed_and_declined_items_do_not_abort_cycle() {
        let (_dir, services, history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(3));
        adapter.failing_ids.lock().unwrap().insert("0".to_string());
        adapter.declined_ids.lock().unwrap().insert("1".to_string());
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(adapter.acted(), vec!["2".to_string()]);
        assert!(!services.dedup.is_processed("radarr", "Main", "0").unwrap());
        assert!(!services.dedup.is_processed("radarr", "Main", "1").unwrap());
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn tag_failure_is_best_effort() {
        let (_dir, services, history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(2));
        adapter.fail_tag.store(true, Ordering::SeqCst);
        let s = settings("radarr", "Main", 2);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.processed, 2);
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn budget_exempt_instance_only_counts_stats() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter = MockAdapter::with_candidates(released(3));
        let mut s = settings("sonarr", "Main", 0);
        s.hunt_missing_items = 2;
        s.counts_against_budget = false;
        s.tag_processed_items = false;

        let report = run_cycle(&services, &adapter, &s, HuntMode::Missing, &never(), &mut rng()).await;

        assert_eq!(report.processed, 2);
        assert_eq!(services.admission.usage("sonarr").unwrap().count, 0);
        assert_eq!(services.admission.stats().unwrap()["sonarr"]["hunted"], 2);
        assert!(adapter.tagged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dedup_lookup_failure_treats_items_as_new() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        services.dedup.mark_processed("radarr", "Main", "0").unwrap();
        services.db.set_offline(true);
        let adapter = MockAdapter::with_candidates(released(3));
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.selection.already_processed, 0);
        assert_eq!(report.processed, 3);
        assert!(adapter.acted().contains(&"0".to_string()));
    }

    #[tokio::test]
    async fn cap_check_failure_allows_action() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        services.admission.set_limit("radarr", 1);
        services.admission.increment("radarr").unwrap();
        services.db.set_offline(true);
        let adapter = MockAdapter::with_candidates(released(2));
        let s = settings("radarr", "Main", 2);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.halt, HaltReason::Completed);
        assert_eq!(adapter.act_count(), 2);
    }

    #[tokio::test]
    async fn mark_failure_is_logged_and_cycle_continues() {
        let (_dir, services, history) = services_tmp(&Config::default());
        services.db.set_offline(true);
        let adapter = MockAdapter::with_candidates(released(3));
        let s = settings("radarr", "Main", 3);

        let report = run_cycle(&services, &adapter, &s, HuntMode::Upgrade, &never(), &mut rng()).await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.halt, HaltReason::Completed);
        assert_eq!(history.len(), 3);
        assert_eq!(adapter.tagged.lock().unwrap().len(), 3);

        services.db.set_offline(false);
        for id in adapter.acted() {
            assert!(!services.dedup.is_processed("radarr", "Main", &id).unwrap());
        }
        assert_eq!(services.admission.usage("radarr").unwrap().count, 0);
    }

    #[tokio::test]
    async fn shared_adapter_behind_arc_is_usable() {
        let (_dir, services, _history) = services_tmp(&Config::default());
        let adapter: Arc<dyn MediaAdapter> = Arc::new(MockAdapter::with_candidates(released(1)));
        let s = settings("radarr", "Main", 1);
        let report =
            run_cycle(&services, adapter.as_ref(), &s, HuntMode::Upgrade, &never(), &mut rng()).await;
        assert!(report.processed_any);
    }
}
