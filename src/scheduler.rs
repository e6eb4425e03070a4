//! Aligns execution with a signal's wall-clock target time
//!
//! Signal times are time-of-day in a fixed reference timezone. The target is
//! the occurrence of that time nearest to now, so a signal a few seconds
//! late is still recognized as late instead of being pushed to tomorrow.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc};
use std::io::Write;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::SchedulerConfig;
use crate::error::{ConfigError, SignalRejection};
use crate::models::{Direction, DurationSpec, RawSignal, Signal};

const COUNTDOWN_REDRAW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Target reached (within the lead time)
    Fired,
    /// Cancelled by the operator
    Skipped,
}

pub struct SignalScheduler {
    config: SchedulerConfig,
    tz: FixedOffset,
}

impl SignalScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        let tz = config.timezone()?;
        Ok(Self { config, tz })
    }

    pub fn timezone(&self) -> FixedOffset {
        self.tz
    }

    /// Turn a raw signal into a typed one. No network calls.
    pub fn validate(&self, raw: &RawSignal) -> Result<Signal, SignalRejection> {
        fn required<'a>(field: &'a Option<String>, name: &'static str) -> Result<&'a str, SignalRejection> {
            match field.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(SignalRejection::MissingField(name)),
            }
        }

        let symbol = required(&raw.symbol, "symbol")?;
        let duration = required(&raw.duration, "duration")?;
        let time = required(&raw.time, "time")?;
        let direction = required(&raw.direction, "direction")?;

        let target_time = NaiveTime::parse_from_str(time, "%H:%M:%S")
            .map_err(|_| SignalRejection::InvalidTime(time.to_string()))?;
        let direction =
            Direction::parse(direction).ok_or_else(|| SignalRejection::InvalidDirection(direction.to_string()))?;

        Ok(Signal {
            symbol: symbol.to_string(),
            duration: DurationSpec::parse(duration),
            target_time,
            direction,
        })
    }

    /// Signed seconds from `now` to the nearest occurrence of `target`
    pub fn seconds_until(&self, target: NaiveTime, now: DateTime<Utc>) -> f64 {
        let local_now = now.with_timezone(&self.tz);
        let today = local_now.date_naive();

        [today - ChronoDuration::days(1), today, today + ChronoDuration::days(1)]
            .iter()
            .filter_map(|day| self.tz.from_local_datetime(&day.and_time(target)).single())
            .map(|candidate| (candidate - local_now).num_milliseconds() as f64 / 1000.0)
            .min_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(f64::INFINITY)
    }

    /// Seconds to wait, or why the signal is out of window
    pub fn check_window(&self, signal: &Signal, now: DateTime<Utc>) -> Result<f64, SignalRejection> {
        let diff = self.seconds_until(signal.target_time, now);
        debug!("Signal {} targets {} ({:.3}s)", signal.symbol, signal.target_time, diff);

        if diff > self.config.max_ahead_secs as f64 {
            return Err(SignalRejection::TooFarInFuture(diff));
        }
        if diff < -(self.config.max_behind_secs as f64) {
            return Err(SignalRejection::Expired(-diff));
        }
        Ok(diff)
    }

    pub async fn wait(&self, signal: &Signal, skip: &CancelToken) -> Result<WaitOutcome, SignalRejection> {
        self.wait_from(signal, Utc::now(), skip).await
    }

    /// Wait until `lead_ms` before the target, as seen from `now`. The skip
    /// token is re-armed first so a stale keypress does not skip this signal.
    pub async fn wait_from(
        &self,
        signal: &Signal,
        now: DateTime<Utc>,
        skip: &CancelToken,
    ) -> Result<WaitOutcome, SignalRejection> {
        let diff = self.check_window(signal, now)?;
        skip.reset();

        let lead = self.config.lead_ms as f64 / 1000.0;
        if diff <= lead {
            return Ok(WaitOutcome::Fired);
        }

        let started = Instant::now();
        let target = started + Duration::from_secs_f64(diff);
        let fire_at = started + Duration::from_secs_f64(diff - lead);
        info!("⏳ Waiting {:.2}s for {} at {}", diff, signal.symbol, signal.target_time);
        if self.config.show_countdown {
            println!("ℹ️ Type 's' and press Enter to skip this trade");
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_draw: Option<Instant> = None;

        let outcome = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(fire_at) => break WaitOutcome::Fired,
                _ = skip.cancelled() => break WaitOutcome::Skipped,
                _ = ticker.tick(), if self.config.show_countdown => {
                    let now = Instant::now();
                    if last_draw.map_or(true, |t| now - t >= COUNTDOWN_REDRAW) {
                        let remaining = target.saturating_duration_since(now).as_secs_f64();
                        let mut out = std::io::stdout();
                        let _ = write!(out, "\r⏱️ Waiting: {:.2} | 's' to skip", remaining);
                        let _ = out.flush();
                        last_draw = Some(now);
                    }
                }
            }
        };

        if self.config.show_countdown {
            let mut out = std::io::stdout();
            let _ = write!(out, "\r{}\r", " ".repeat(50));
            let _ = out.flush();
        }

        match outcome {
            WaitOutcome::Fired => debug!("Fired after {:?}", started.elapsed()),
            WaitOutcome::Skipped => info!("✅ Trade skipped by operator for {}", signal.symbol),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> SignalScheduler {
        SignalScheduler::new(SchedulerConfig { show_countdown: false, ..Default::default() }).unwrap()
    }

    /// A UTC instant whose UTC-3 wall clock is `hh:mm:ss`
    fn at_local(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        let tz = FixedOffset::west_opt(3 * 3600).unwrap();
        tz.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap().with_timezone(&Utc)
    }

    fn signal_at(time: &str) -> Signal {
        scheduler().validate(&RawSignal::new("EURUSD", "M1", time, "call")).unwrap()
    }

    #[test]
    fn test_validate_missing_and_malformed() {
        let s = scheduler();
        let mut raw = RawSignal::new("EURUSD", "M1", "10:00:00", "call");
        raw.direction = None;
        assert_eq!(s.validate(&raw), Err(SignalRejection::MissingField("direction")));

        let raw = RawSignal::new("EURUSD", "M1", "10:00", "call");
        assert!(matches!(s.validate(&raw), Err(SignalRejection::InvalidTime(_))));

        let raw = RawSignal::new("EURUSD", "M1", "10:00:00", "up");
        assert!(matches!(s.validate(&raw), Err(SignalRejection::InvalidDirection(_))));
    }

    #[test]
    fn test_window_bounds() {
        let s = scheduler();
        let now = at_local(12, 0, 0);

        assert!(matches!(s.check_window(&signal_at("12:11:40"), now), Err(SignalRejection::TooFarInFuture(d)) if d == 700.0));
        assert!(matches!(s.check_window(&signal_at("11:59:00"), now), Err(SignalRejection::Expired(d)) if d == 60.0));
        assert_eq!(s.check_window(&signal_at("11:59:45"), now), Ok(-15.0));
        assert_eq!(s.check_window(&signal_at("12:10:00"), now), Ok(600.0));
    }

    #[test]
    fn test_nearest_occurrence_across_midnight() {
        let s = scheduler();
        assert_eq!(s.seconds_until(signal_at("00:00:05").target_time, at_local(23, 59, 50)), 15.0);
        assert_eq!(s.seconds_until(signal_at("23:59:50").target_time, at_local(0, 0, 5)), -15.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_lead_before_target() {
        let s = scheduler();
        let skip = CancelToken::new();
        let started = Instant::now();

        let outcome = s.wait_from(&signal_at("12:00:10"), at_local(12, 0, 0), &skip).await;

        assert_eq!(outcome, Ok(WaitOutcome::Fired));
        assert_eq!(started.elapsed(), Duration::from_millis(9_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cancels_wait() {
        let s = scheduler();
        let skip = CancelToken::new();
        let trigger = skip.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let outcome = s.wait_from(&signal_at("12:01:00"), at_local(12, 0, 0), &skip).await;

        assert_eq!(outcome, Ok(WaitOutcome::Skipped));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_skip_is_cleared() {
        let s = scheduler();
        let skip = CancelToken::new();
        skip.cancel();

        let outcome = s.wait_from(&signal_at("12:00:02"), at_local(12, 0, 0), &skip).await;
        assert_eq!(outcome, Ok(WaitOutcome::Fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_signal_fires_immediately() {
        let s = scheduler();
        let started = Instant::now();
        let outcome = s.wait_from(&signal_at("11:59:50"), at_local(12, 0, 0), &CancelToken::new()).await;
        assert_eq!(outcome, Ok(WaitOutcome::Fired));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
