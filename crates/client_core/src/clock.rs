//! Pure display-clock logic shared by every client surface.
//!
//! A snapshot is converted into a [`DisplayClock`] once; every subsequent
//! tick re-derives the displayed value from the fixed anchor captured at
//! snapshot time, so repeated ticks never accumulate drift.

use chrono::{DateTime, Utc};
use shared::protocol::{LapSummary, StopwatchSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockMode {
    Running { anchor: DateTime<Utc> },
    Paused { elapsed_ms: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayClock {
    mode: ClockMode,
}

impl DisplayClock {
    /// A clock ticking against the server-provided run anchor.
    pub fn running(anchor: DateTime<Utc>) -> Self {
        Self {
            mode: ClockMode::Running { anchor },
        }
    }

    /// A frozen clock showing the accumulated total verbatim.
    pub fn paused(elapsed_ms: i64) -> Self {
        Self {
            mode: ClockMode::Paused {
                elapsed_ms: elapsed_ms.max(0),
            },
        }
    }

    pub fn from_snapshot(snapshot: &StopwatchSnapshot) -> Self {
        if snapshot.is_running {
            Self::running(snapshot.start_time)
        } else {
            Self::paused(snapshot.elapsed_time)
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.mode, ClockMode::Running { .. })
    }

    /// Displayed elapsed milliseconds at `local_now`. Running clocks derive
    /// the value from the anchor on every call; paused clocks return the
    /// fixed total.
    pub fn elapsed_ms(&self, local_now: DateTime<Utc>) -> i64 {
        match self.mode {
            ClockMode::Running { anchor } => (local_now - anchor).num_milliseconds().max(0),
            ClockMode::Paused { elapsed_ms } => elapsed_ms,
        }
    }
}

/// `MM:SS.cc` under an hour, `HH:MM:SS` from one hour up, matching what the
/// stopwatch display renders.
pub fn format_elapsed(ms: i64) -> String {
    let ms = ms.max(0);
    let centis = (ms % 1000) / 10;
    let seconds = (ms / 1000) % 60;
    let minutes = (ms / (1000 * 60)) % 60;
    let hours = ms / (1000 * 60 * 60);

    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}.{centis:02}")
    }
}

/// Per-lap durations from the newest-first absolute lap times the snapshot
/// carries. The oldest lap's segment is measured from zero.
pub fn lap_segments(laps: &[LapSummary]) -> Vec<i64> {
    laps.iter()
        .enumerate()
        .map(|(index, lap)| {
            let previous = laps.get(index + 1).map(|older| older.time).unwrap_or(0);
            lap.time - previous
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use shared::domain::LapId;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn running_clock_derives_display_from_anchor() {
        let clock = DisplayClock::running(t0());
        let shown = clock.elapsed_ms(t0() + Duration::milliseconds(5000));
        assert_eq!(shown, 5000);
        assert_eq!(format_elapsed(shown), "00:05.00");
    }

    #[test]
    fn repeated_sampling_does_not_drift() {
        let clock = DisplayClock::running(t0());
        // Sample tick-by-tick and directly; a drifting implementation would
        // disagree after many iterations.
        let mut last = 0;
        for tick in 1..=1000 {
            last = clock.elapsed_ms(t0() + Duration::milliseconds(tick * 10));
        }
        assert_eq!(last, clock.elapsed_ms(t0() + Duration::milliseconds(10_000)));
    }

    #[test]
    fn paused_clock_shows_stored_total_immediately() {
        let clock = DisplayClock::paused(5000);
        assert!(!clock.is_running());
        assert_eq!(clock.elapsed_ms(t0()), 5000);
        assert_eq!(clock.elapsed_ms(t0() + Duration::seconds(60)), 5000);
        assert_eq!(format_elapsed(5000), "00:05.00");
    }

    #[test]
    fn clock_skew_never_shows_negative_elapsed() {
        let clock = DisplayClock::running(t0());
        assert_eq!(clock.elapsed_ms(t0() - Duration::milliseconds(30)), 0);
    }

    #[test]
    fn snapshot_selects_mode() {
        let snapshot = StopwatchSnapshot {
            stopwatch_id: "main".into(),
            is_running: true,
            start_time: t0(),
            elapsed_time: 0,
            laps: Vec::new(),
        };
        assert!(DisplayClock::from_snapshot(&snapshot).is_running());

        let paused = StopwatchSnapshot {
            is_running: false,
            elapsed_time: 1234,
            ..snapshot
        };
        let clock = DisplayClock::from_snapshot(&paused);
        assert_eq!(clock.elapsed_ms(t0()), 1234);
    }

    #[test]
    fn formats_switch_to_hours_past_sixty_minutes() {
        assert_eq!(format_elapsed(0), "00:00.00");
        assert_eq!(format_elapsed(1200), "00:01.20");
        assert_eq!(format_elapsed(59 * 60 * 1000 + 59_990), "59:59.99");
        assert_eq!(format_elapsed(3_600_000), "01:00:00");
        assert_eq!(format_elapsed(3_600_000 + 61_000), "01:01:01");
    }

    #[test]
    fn lap_segments_are_differences_between_consecutive_absolutes() {
        let laps = vec![
            LapSummary::new(LapId(2), 3200),
            LapSummary::new(LapId(1), 1200),
        ];
        let segments = lap_segments(&laps);
        assert_eq!(segments, vec![2000, 1200]);
        assert_eq!(format_elapsed(segments[0]), "00:02.00");
        assert_eq!(format_elapsed(segments[1]), "00:01.20");
    }

    #[test]
    fn lap_segments_of_empty_list_is_empty() {
        assert!(lap_segments(&[]).is_empty());
    }
}
