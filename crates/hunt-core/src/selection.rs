//! Candidate filtering and bounded random sampling for one cycle.
//!
//! `select` is pure apart from the `is_processed` callback and the injected
//! random source, so tests can seed an `StdRng` and assert exact picks.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::adapter::HuntMode;
use crate::config::InstanceSettings;

/// An item reported by a remote service as eligible for action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default = "default_true")]
    pub monitored: bool,
}

fn default_true() -> bool {
    true
}

impl Candidate {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            year: None,
            release_date: None,
            monitored: true,
        }
    }

    pub fn with_release_date(mut self, date: impl Into<String>) -> Self {
        self.release_date = Some(date.into());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    /// Human label for history entries, e.g. `Alien (1979)`.
    pub fn media_label(&self) -> String {
        match self.year {
            Some(y) => format!("{} ({y})", self.title),
            None => self.title.clone(),
        }
    }

    pub fn parsed_release_date(&self) -> Option<DateTime<Utc>> {
        self.release_date.as_deref().and_then(parse_release_date)
    }
}

// ---------------------------------------------------------------------------
// Config and result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    pub skip_future_releases: bool,
    pub process_no_release_dates: bool,
    pub release_date_delay_days: i64,
    pub count: i64,
}

impl SelectionConfig {
    pub fn for_mode(settings: &InstanceSettings, mode: HuntMode) -> Self {
        Self {
            skip_future_releases: settings.skip_future_releases,
            process_no_release_dates: settings.process_no_release_dates,
            release_date_delay_days: settings.release_date_delay_days,
            count: mode.hunt_count(settings),
        }
    }
}

/// How many candidates each stage dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionStats {
    pub fetched: usize,
    pub future: usize,
    pub no_release_date: usize,
    pub delayed: usize,
    pub already_processed: usize,
    pub eligible: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionResult {
    pub items: Vec<Candidate>,
    pub stats: SelectionStats,
}

impl SelectionResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

// ---------------------------------------------------------------------------
// Date handling
// ---------------------------------------------------------------------------

/// Parse RFC 3339, `YYYY-MM-DDTHH:MM:SS[.f][Z]`, or a bare `YYYY-MM-DD`
/// (midnight UTC). Anything else is `None`.
pub fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// True while `now` is still inside the post-release waiting period. A
/// period that ends past the representable range never elapses.
pub fn should_delay(release: DateTime<Utc>, delay_days: i64, now: DateTime<Utc>) -> bool {
    if delay_days <= 0 {
        return false;
    }
    TimeDelta::try_days(delay_days)
        .and_then(|delay| release.checked_add_signed(delay))
        .map_or(true, |ready| now < ready)
}

// ---------------------------------------------------------------------------
// select
// ---------------------------------------------------------------------------

/// Run every filter stage in order, then sample without replacement.
pub fn select<F, R>(
    candidates: Vec<Candidate>,
    config: &SelectionConfig,
    now: DateTime<Utc>,
    mut is_processed: F,
    rng: &mut R,
) -> SelectionResult
where
    F: FnMut(&Candidate) -> bool,
    R: Rng + ?Sized,
{
    let mut stats = SelectionStats {
        fetched: candidates.len(),
        ..SelectionStats::default()
    };

    let mut pool = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let release = candidate.parsed_release_date();
        match release {
            Some(date) => {
                if config.skip_future_releases && date > now {
                    stats.future += 1;
                    continue;
                }
                if should_delay(date, config.release_date_delay_days, now) {
                    stats.delayed += 1;
                    continue;
                }
            }
            None if !config.process_no_release_dates => {
                stats.no_release_date += 1;
                continue;
            }
            None => {}
        }
        if is_processed(&candidate) {
            stats.already_processed += 1;
            continue;
        }
        pool.push(candidate);
    }
    stats.eligible = pool.len();

    let want = usize::try_from(config.count).unwrap_or(0).min(pool.len());
    if want == 0 {
        return SelectionResult {
            items: Vec::new(),
            stats,
        };
    }

    let indices = rand::seq::index::sample(rng, pool.len(), want);
    let mut slots: Vec<Option<Candidate>> = pool.into_iter().map(Some).collect();
    let items = indices
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();

    SelectionResult { items, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn cfg(count: i64) -> SelectionConfig {
        SelectionConfig {
            skip_future_releases: true,
            process_no_release_dates: false,
            release_date_delay_days: 0,
            count,
        }
    }

    fn dated(id: &str, date: DateTime<Utc>) -> Candidate {
        Candidate::new(id, format!("Title {id}")).with_release_date(date.to_rfc3339())
    }

    fn batch(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| dated(&i.to_string(), now() - Duration::days(30)))
            .collect()
    }

    fn run(candidates: Vec<Candidate>, config: &SelectionConfig) -> SelectionResult {
        let mut rng = StdRng::seed_from_u64(7);
        select(candidates, config, now(), |_| false, &mut rng)
    }

    #[test]
    fn parses_supported_date_formats() {
        let midnight = Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap();
        assert_eq!(parse_release_date("2024-02-03"), Some(midnight));
        assert_eq!(parse_release_date("2024-02-03T00:00:00Z"), Some(midnight));
        assert_eq!(parse_release_date("2024-02-03T00:00:00"), Some(midnight));
        assert_eq!(parse_release_date("2024-02-03T02:00:00+02:00"), Some(midnight));
        assert_eq!(parse_release_date("2024-02-03T00:00:00.000Z"), Some(midnight));
        assert_eq!(parse_release_date("soon"), None);
        assert_eq!(parse_release_date(""), None);
    }

    #[test]
    fn sample_is_bounded_by_count() {
        assert_eq!(run(batch(10), &cfg(3)).len(), 3);
        assert_eq!(run(batch(2), &cfg(5)).len(), 2);
    }

    #[test]
    fn non_positive_count_selects_nothing() {
        assert!(run(batch(10), &cfg(0)).is_empty());
        let result = run(batch(10), &cfg(-4));
        assert!(result.is_empty());
        assert_eq!(result.stats.eligible, 10);
    }

    #[test]
    fn empty_batch_selects_nothing() {
        let result = run(Vec::new(), &cfg(5));
        assert!(result.is_empty());
        assert_eq!(result.stats, SelectionStats::default());
    }

    #[test]
    fn future_release_excluded_when_skipping() {
        let future = dated("f", now() + Duration::days(10));
        let mut config = cfg(10);
        config.process_no_release_dates = true;
        config.release_date_delay_days = 0;
        let result = run(vec![future.clone()], &config);
        assert!(result.is_empty());
        assert_eq!(result.stats.future, 1);

        config.skip_future_releases = false;
        assert_eq!(run(vec![future], &config).len(), 1);
    }

    #[test]
    fn missing_date_kept_only_when_enabled() {
        let undated = Candidate::new("u", "Undated");
        let garbage = Candidate::new("g", "Garbage").with_release_date("TBA");

        let result = run(vec![undated.clone(), garbage.clone()], &cfg(10));
        assert!(result.is_empty());
        assert_eq!(result.stats.no_release_date, 2);

        let mut config = cfg(10);
        config.process_no_release_dates = true;
        assert_eq!(run(vec![undated.clone(), garbage.clone()], &config).len(), 2);

        // Applies even when future filtering is off.
        let mut config = cfg(10);
        config.skip_future_releases = false;
        assert!(run(vec![undated], &config).is_empty());
    }

    #[test]
    fn delay_filter_uses_days_since_release() {
        let mut config = cfg(10);
        config.release_date_delay_days = 3;
        let recent = dated("recent", now() - Duration::days(1));
        let older = dated("older", now() - Duration::days(5));
        let result = run(vec![recent, older], &config);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].id, "older");
        assert_eq!(result.stats.delayed, 1);
    }

    #[test]
    fn delay_never_applies_to_undated_or_non_positive() {
        assert!(!should_delay(now(), 0, now()));
        assert!(!should_delay(now(), -2, now()));
        assert!(should_delay(now(), 1, now()));

        let mut config = cfg(10);
        config.release_date_delay_days = 30;
        config.process_no_release_dates = true;
        assert_eq!(run(vec![Candidate::new("u", "Undated")], &config).len(), 1);
    }

    #[test]
    fn huge_delay_keeps_item_waiting_instead_of_overflowing() {
        let release = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(should_delay(release, 100_000_000, now()));
        assert!(should_delay(release, i64::MAX, now()));

        let mut config = cfg(10);
        config.release_date_delay_days = i64::MAX;
        let result = run(vec![dated("old", release)], &config);
        assert!(result.is_empty());
        assert_eq!(result.stats.delayed, 1);
    }

    #[test]
    fn already_processed_dropped() {
        let mut rng = StdRng::seed_from_u64(1);
        let result = select(batch(6), &cfg(10), now(), |c| c.id == "2" || c.id == "4", &mut rng);
        assert_eq!(result.len(), 4);
        assert_eq!(result.stats.already_processed, 2);
        assert!(result.items.iter().all(|c| c.id != "2" && c.id != "4"));
    }

    #[test]
    fn filtered_subset_sampled_without_duplicates() {
        let candidates = batch(50);
        let keep = |c: &Candidate| c.id.parse::<u32>().unwrap() % 3 == 0;
        let filtered: HashSet<String> = candidates
            .iter()
            .filter(|c| keep(c))
            .map(|c| c.id.clone())
            .collect();

        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let k = (seed as i64 % 25) + 1;
            let result = select(candidates.clone(), &cfg(k), now(), |c| !keep(c), &mut rng);
            let ids: HashSet<String> = result.items.iter().map(|c| c.id.clone()).collect();
            assert_eq!(ids.len(), result.len(), "duplicate in sample");
            assert_eq!(result.len(), (k as usize).min(filtered.len()));
            assert!(ids.is_subset(&filtered));
        }
    }

    #[test]
    fn same_seed_gives_same_selection() {
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            select(batch(30), &cfg(5), now(), |_| false, &mut rng)
                .items
                .into_iter()
                .map(|c| c.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(pick(42), pick(42));
    }

    #[test]
    fn media_label_includes_year() {
        assert_eq!(Candidate::new("1", "Alien").with_year(1979).media_label(), "Alien (1979)");
        assert_eq!(Candidate::new("2", "Alien").media_label(), "Alien");
    }
}
