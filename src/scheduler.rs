//! Background refresh scheduler.
//!
//! A single thread wakes every `scheduler_interval_ms`, refreshes the
//! dictionaries that are due, and opportunistically compacts tables. The
//! tick logic is a pure function over an explicit clock so it can be tested
//! without threads.
//!
//! # Error handling
//! - Retryable failures back off exponentially per dictionary (see
//!   [`RetryPolicy`]); a failed rebuild leaves the previous generation in
//!   place, so lookups keep serving stale-but-consistent paths.
//! - After `max_consecutive_errors` hard failures a dictionary's scheduled
//!   refresh is suspended until a manual
//!   [`Pipeline::refresh_dictionary`] succeeds.
//!
//! Cancellation is not meaningful for refreshes — they are periodic and
//! idempotent. Shutdown just stops scheduling new ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{CascadeError, RetryPolicy, RetryState};
use crate::pipeline::Pipeline;

// ── Schedule parsing ───────────────────────────────────────────────────────

/// Parsed schedule specification — either a duration-based interval or a
/// cron expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Refresh when the last refresh is older than this many seconds.
    Interval(i64),
    /// Refresh at the times specified by the cron expression.
    Cron(String),
}

/// Parse a Prometheus/GNU-style duration string into seconds.
///
/// Supported units: `s`, `m`, `h`, `d`, `w`. Compound durations like
/// `1h30m` are supported; a bare integer is seconds.
pub fn parse_duration(s: &str) -> Result<i64, CascadeError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CascadeError::InvalidArgument(
            "schedule cannot be empty".into(),
        ));
    }

    // Bare integer → seconds
    if let Ok(secs) = s.parse::<i64>() {
        return if secs >= 0 {
            Ok(secs)
        } else {
            Err(CascadeError::InvalidArgument(format!(
                "schedule cannot be negative: '{s}'"
            )))
        };
    }

    let mut total_secs: i64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
        } else {
            let multiplier = match ch {
                's' => 1i64,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                'w' => 604800,
                _ => {
                    return Err(CascadeError::InvalidArgument(format!(
                        "invalid duration unit '{ch}' in '{s}'. \
                         Use s (seconds), m (minutes), h (hours), d (days), w (weeks). \
                         Example: '5m', '1h30m', '2d'"
                    )));
                }
            };

            if num_buf.is_empty() {
                return Err(CascadeError::InvalidArgument(format!(
                    "expected a number before '{ch}' in duration '{s}'"
                )));
            }

            let n: i64 = num_buf.parse().map_err(|_| {
                CascadeError::InvalidArgument(format!(
                    "invalid number '{num_buf}' in duration '{s}'"
                ))
            })?;

            total_secs += n * multiplier;
            num_buf.clear();
            found_unit = true;
        }
    }

    if !num_buf.is_empty() {
        if found_unit {
            return Err(CascadeError::InvalidArgument(format!(
                "trailing digits '{num_buf}' without a unit in duration '{s}'. \
                 Append s, m, h, d, or w. Example: '1h30m'"
            )));
        }
        return Err(CascadeError::InvalidArgument(format!(
            "invalid duration '{s}'"
        )));
    }

    Ok(total_secs)
}

/// Parse a schedule string as either a duration or a cron expression.
///
/// Cron patterns are detected by the presence of spaces or a `@` prefix
/// (`@hourly`, `@daily`, …); duration strings never contain either.
pub fn parse_schedule(s: &str) -> Result<Schedule, CascadeError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CascadeError::InvalidArgument(
            "schedule cannot be empty".into(),
        ));
    }

    if s.starts_with('@') || s.contains(' ') {
        validate_cron(s)?;
        Ok(Schedule::Cron(s.to_string()))
    } else {
        Ok(Schedule::Interval(parse_duration(s)?))
    }
}

fn validate_cron(expr: &str) -> Result<(), CascadeError> {
    use std::str::FromStr;

    croner::Cron::from_str(expr).map_err(|e| {
        CascadeError::InvalidArgument(format!("invalid cron expression '{expr}': {e}"))
    })?;
    Ok(())
}

/// Whether a cron schedule is due: `now >= next_occurrence(last_refresh)`.
/// A never-refreshed target is always due.
pub fn cron_is_due(cron_expr: &str, last_refresh_epoch: Option<i64>, now_epoch: i64) -> bool {
    use std::str::FromStr;

    let cron = match croner::Cron::from_str(cron_expr) {
        Ok(c) => c,
        Err(_) => return false,
    };

    match last_refresh_epoch {
        None => true,
        Some(epoch) => {
            let Some(last) = chrono::DateTime::from_timestamp(epoch, 0) else {
                return true;
            };
            let Some(now) = chrono::DateTime::from_timestamp(now_epoch, 0) else {
                return true;
            };
            match cron.find_next_occurrence(&last, false) {
                Ok(next) => now >= next,
                Err(_) => false,
            }
        }
    }
}

// ── Tick state and logic ───────────────────────────────────────────────────

/// Mutable scheduler state, kept across ticks (in-memory only).
#[derive(Debug, Default)]
pub struct SchedulerState {
    /// Last successful refresh per dictionary, epoch seconds.
    last_refresh: HashMap<String, i64>,
    /// Backoff state per dictionary.
    retry: HashMap<String, RetryState>,
    /// Hard-failure counts per dictionary.
    consecutive_errors: HashMap<String, u32>,
    /// Dictionaries whose scheduled refresh is suspended.
    suspended: HashSet<String>,
    /// Last opportunistic compaction, epoch seconds.
    last_compaction: Option<i64>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_suspended(&self, dictionary: &str) -> bool {
        self.suspended.contains(dictionary)
    }

    pub fn last_refresh_epoch(&self, dictionary: &str) -> Option<i64> {
        self.last_refresh.get(dictionary).copied()
    }
}

/// Whether one dictionary is due at `now_epoch`.
///
/// An explicit schedule (duration or cron) wins; otherwise the interval is
/// the midpoint of the dictionary's declared refresh bounds. A
/// never-refreshed dictionary is always due.
fn dictionary_due(
    schedule: Option<&str>,
    default_interval_secs: u64,
    last_refresh: Option<i64>,
    now_epoch: i64,
) -> bool {
    match schedule.map(parse_schedule) {
        Some(Ok(Schedule::Cron(expr))) => cron_is_due(&expr, last_refresh, now_epoch),
        Some(Ok(Schedule::Interval(secs))) => match last_refresh {
            None => true,
            Some(last) => now_epoch - last >= secs,
        },
        // An unparsable schedule was rejected at registration; treat a
        // stray one as "use the bounds".
        Some(Err(_)) | None => match last_refresh {
            None => true,
            Some(last) => now_epoch - last >= default_interval_secs as i64,
        },
    }
}

/// One scheduler tick: refresh due dictionaries, then maybe compact.
///
/// Pure over the passed clock; the background thread calls this with the
/// wall clock, tests call it with whatever they like.
pub fn tick(
    pipeline: &Pipeline,
    state: &mut SchedulerState,
    policy: &RetryPolicy,
    now_epoch: i64,
) {
    if !pipeline.config().enabled {
        return;
    }
    let now_ms = (now_epoch as u64).saturating_mul(1000);

    for name in pipeline.dictionary_names() {
        if state.suspended.contains(&name) {
            continue;
        }
        if let Some(retry) = state.retry.get(&name)
            && retry.is_in_backoff(now_ms)
        {
            continue;
        }

        // Read declaration data without the grant gate: refresh is the
        // engine's own rebuild, not a user lookup.
        let Ok(dict) = pipeline.dictionary_ungated(&name) else {
            continue;
        };
        let schedule = dict.def().schedule.clone();
        let interval = dict.def().effective_refresh_secs();

        if !dictionary_due(
            schedule.as_deref(),
            interval,
            state.last_refresh.get(&name).copied(),
            now_epoch,
        ) {
            continue;
        }

        match pipeline.refresh_dictionary(&name) {
            Ok(entries) => {
                log::debug!("scheduler: refreshed dictionary '{name}' ({entries} entries)");
                state.last_refresh.insert(name.clone(), now_epoch);
                state.retry.remove(&name);
                state.consecutive_errors.remove(&name);
            }
            Err(e) if e.is_retryable() => {
                let retry = state.retry.entry(name.clone()).or_default();
                let again = retry.record_failure(policy, now_ms);
                log::warn!(
                    "scheduler: dictionary '{name}' refresh failed (attempt {}): {e}",
                    retry.attempts
                );
                if !again {
                    state.suspended.insert(name.clone());
                    log::warn!("scheduler: dictionary '{name}' suspended after retries");
                }
            }
            Err(e) => {
                let errors = state.consecutive_errors.entry(name.clone()).or_insert(0);
                if e.counts_toward_suspension() {
                    *errors += 1;
                }
                log::warn!(
                    "scheduler: dictionary '{name}' refresh failed hard ({errors} consecutive): {e}"
                );
                // The previous generation stays in place.
                state.last_refresh.insert(name.clone(), now_epoch);
                if *errors >= pipeline.config().max_consecutive_errors {
                    state.suspended.insert(name.clone());
                    log::warn!(
                        "scheduler: dictionary '{name}' suspended after {errors} consecutive errors"
                    );
                }
            }
        }
    }

    // Opportunistic compaction on its own cadence.
    let compaction_due = match state.last_compaction {
        None => true,
        Some(last) => now_epoch - last >= pipeline.config().compaction_interval_secs as i64,
    };
    if compaction_due {
        let removed = pipeline.compact_all();
        if removed > 0 {
            log::debug!("scheduler: compaction removed {removed} physical rows");
        }
        state.last_compaction = Some(now_epoch);
    }
}

// ── Background thread ──────────────────────────────────────────────────────

/// Handle to the background refresh thread.
pub struct RefreshScheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    /// Start the scheduler thread.
    pub fn start(pipeline: Arc<Pipeline>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let interval = Duration::from_millis(pipeline.config().scheduler_interval_ms);

        let handle = std::thread::Builder::new()
            .name("cascade-scheduler".into())
            .spawn(move || {
                log::info!("scheduler started (interval={:?})", interval);
                let mut state = SchedulerState::new();
                let policy = RetryPolicy::default();
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let now_epoch = chrono::Utc::now().timestamp();
                    tick(&pipeline, &mut state, &policy, now_epoch);
                }
                log::info!("scheduler shutting down");
            })
            .expect("failed to spawn scheduler thread");

        RefreshScheduler {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signal shutdown and join the thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_duration ─────────────────────────────────────────────

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), 30);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("1d").unwrap(), 86400);
        assert_eq!(parse_duration("2w").unwrap(), 1_209_600);
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), 5400);
        assert_eq!(parse_duration("2m30s").unwrap(), 150);
    }

    #[test]
    fn test_parse_duration_bare_integer_is_seconds() {
        assert_eq!(parse_duration("60").unwrap(), 60);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("1h30").is_err());
        assert!(parse_duration("-5").is_err());
    }

    // ── parse_schedule ─────────────────────────────────────────────

    #[test]
    fn test_parse_schedule_duration() {
        assert_eq!(parse_schedule("5m").unwrap(), Schedule::Interval(300));
    }

    #[test]
    fn test_parse_schedule_cron() {
        assert_eq!(
            parse_schedule("*/5 * * * *").unwrap(),
            Schedule::Cron("*/5 * * * *".to_string())
        );
        assert_eq!(
            parse_schedule("@hourly").unwrap(),
            Schedule::Cron("@hourly".to_string())
        );
    }

    #[test]
    fn test_parse_schedule_invalid_cron() {
        assert!(parse_schedule("not a cron at all ever").is_err());
    }

    // ── cron_is_due ────────────────────────────────────────────────

    #[test]
    fn test_cron_never_refreshed_is_due() {
        assert!(cron_is_due("@hourly", None, 1_700_000_000));
    }

    #[test]
    fn test_cron_due_after_next_occurrence() {
        let last = 1_700_000_000;
        // Two hours later an @hourly schedule is definitely due.
        assert!(cron_is_due("@hourly", Some(last), last + 7200));
        // One second later it is not.
        assert!(!cron_is_due("@hourly", Some(last), last + 1));
    }

    // ── dictionary_due ─────────────────────────────────────────────

    #[test]
    fn test_dictionary_due_interval() {
        assert!(dictionary_due(None, 180, None, 1000));
        assert!(!dictionary_due(None, 180, Some(900), 1000));
        assert!(dictionary_due(None, 180, Some(800), 1000));
    }

    #[test]
    fn test_dictionary_due_explicit_duration() {
        assert!(dictionary_due(Some("50s"), 180, Some(950), 1000));
        assert!(!dictionary_due(Some("100s"), 180, Some(950), 1000));
    }
}
