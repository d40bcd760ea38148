#![forbid(unsafe_code)]

//! Cyclical spending allowance.
//!
//! Every participant follows the same `sin²(θ/2)` curve over one cycle, shifted
//! by an evenly spaced fraction of the cycle according to rank, so peaks are
//! staggered across the roster. The curve is scaled by `1/√N` so the combined
//! draw of a larger roster stays bounded.

use std::f64::consts::{PI, TAU};

use fund_feed_types::{Address, CycleParameters, Roster, Timestamp};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CycleLocation {
    pub rank_offset_seconds: u64,
    pub phase_seconds: u64,
    pub phase_radians: f64,
    pub cycle_max_timestamp: Timestamp,
    pub allowance_fraction: f64,
}

impl CycleLocation {
    pub const ZERO: CycleLocation = CycleLocation {
        rank_offset_seconds: 0,
        phase_seconds: 0,
        phase_radians: 0.0,
        cycle_max_timestamp: 0,
        allowance_fraction: 0.0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// Where `rank` sits in its cycle at `now`. Missing or zero rank, a zero cycle
/// length or an empty roster all yield `CycleLocation::ZERO`.
pub fn cycle_location(rank: Option<u64>, params: &CycleParameters, now: Timestamp) -> CycleLocation {
    let Some(rank) = rank.filter(|rank| *rank > 0) else {
        return CycleLocation::ZERO;
    };
    if params.is_degenerate() {
        return CycleLocation::ZERO;
    }

    let cycle = i128::from(params.cycle_length);
    let count = i128::from(params.participant_count);
    let start = i128::from(params.start_time);
    let offset = (i128::from(rank) - 1).saturating_mul(cycle) / count;
    let elapsed = i128::from(now) - start;

    let phase_seconds = elapsed.saturating_add(offset).rem_euclid(cycle);
    let phase_radians = phase_seconds as f64 / cycle as f64 * TAU;

    // The instant in the current global cycle at which this rank's phase is π.
    let global_cycle_start = start + elapsed.div_euclid(cycle) * cycle;
    let cycle_max = global_cycle_start - offset + cycle / 2;

    CycleLocation {
        rank_offset_seconds: u64::try_from(offset).unwrap_or(u64::MAX),
        phase_seconds: u64::try_from(phase_seconds).unwrap_or(u64::MAX),
        phase_radians,
        cycle_max_timestamp: u64::try_from(cycle_max.max(0)).unwrap_or(u64::MAX),
        allowance_fraction: allowance_fraction(phase_radians, params.participant_count),
    }
}

/// Cycle location for `address` using the roster's rank and size.
pub fn cycle_location_of(
    roster: &Roster,
    address: &Address,
    start_time: Timestamp,
    cycle_length: u64,
    now: Timestamp,
) -> CycleLocation {
    let params = CycleParameters {
        start_time,
        cycle_length,
        participant_count: roster.participant_count(),
    };
    cycle_location(roster.rank_of(address), &params, now)
}

pub fn allowance_fraction(phase_radians: f64, participant_count: u64) -> f64 {
    if participant_count == 0 {
        return 0.0;
    }
    let wave = (phase_radians / 2.0).sin();
    wave * wave / (participant_count as f64).sqrt()
}

pub fn max_allowance_fraction(participant_count: u64) -> f64 {
    if participant_count == 0 {
        return 0.0;
    }
    1.0 / (participant_count as f64).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoonPhase {
    New,
    Waxing,
    Full,
    Waning,
}

impl MoonPhase {
    pub fn label(self) -> &'static str {
        match self {
            MoonPhase::New => "New Moon",
            MoonPhase::Waxing => "Waxing",
            MoonPhase::Full => "Full Moon",
            MoonPhase::Waning => "Waning",
        }
    }
}

pub fn moon_phase(phase_radians: f64) -> MoonPhase {
    if !(0.05 * PI..=1.95 * PI).contains(&phase_radians) {
        MoonPhase::New
    } else if phase_radians > 0.95 * PI && phase_radians < 1.05 * PI {
        MoonPhase::Full
    } else if phase_radians < PI {
        MoonPhase::Waxing
    } else {
        MoonPhase::Waning
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "direction", content = "seconds")]
pub enum PeakDistance {
    Until(u64),
    Since(u64),
}

/// Distance to the nearest peak within the current cycle.
pub fn peak_distance(location: &CycleLocation, cycle_length: u64) -> PeakDistance {
    let half = cycle_length / 2;
    if location.phase_seconds <= half {
        PeakDistance::Until(half - location.phase_seconds)
    } else {
        PeakDistance::Since(location.phase_seconds - half)
    }
}

/// `1d 02h 03m 04s`.
pub fn format_countdown(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    format!("{days}d {hours:02}h {minutes:02}m {secs:02}s")
}

#[cfg(test)]
mod tests {
    use fund_feed_types::RosterEntry;

    use super::*;

    const WEEK: u64 = 604_800;

    fn params(start_time: u64, cycle_length: u64, participant_count: u64) -> CycleParameters {
        CycleParameters {
            start_time,
            cycle_length,
            participant_count,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn single_participant_peaks_at_half_cycle() {
        let location = cycle_location(Some(1), &params(0, WEEK, 1), 302_400);
        assert_eq!(location.rank_offset_seconds, 0);
        assert_close(location.phase_radians, PI);
        assert_close(location.allowance_fraction, 1.0);
        assert_eq!(location.cycle_max_timestamp, 302_400);
        assert_eq!(moon_phase(location.phase_radians), MoonPhase::Full);
    }

    #[test]
    fn single_participant_is_empty_at_cycle_start() {
        let location = cycle_location(Some(1), &params(0, WEEK, 1), 0);
        assert_close(location.phase_radians, 0.0);
        assert_close(location.allowance_fraction, 0.0);
        assert_eq!(moon_phase(location.phase_radians), MoonPhase::New);
    }

    #[test]
    fn degenerate_inputs_yield_zero_location() {
        let valid = params(100, WEEK, 3);
        assert!(cycle_location(None, &valid, 5_000).is_zero());
        assert!(cycle_location(Some(0), &valid, 5_000).is_zero());
        assert!(cycle_location(Some(1), &params(100, 0, 3), 5_000).is_zero());
        assert!(cycle_location(Some(1), &params(100, WEEK, 0), 5_000).is_zero());
    }

    #[test]
    fn rank_offset_staggers_peaks() {
        // rank 3 of 4 is half a cycle ahead, so it peaks right at the start.
        let location = cycle_location(Some(3), &params(1_000, 400, 4), 1_000);
        assert_eq!(location.rank_offset_seconds, 200);
        assert_eq!(location.phase_seconds, 200);
        assert_close(location.phase_radians, PI);
        assert_close(location.allowance_fraction, 0.5);
        assert_eq!(location.cycle_max_timestamp, 1_000);
    }

    #[test]
    fn cycle_max_marks_the_phase_peak() {
        let p = params(50, 1_000, 5);
        for rank in 1..=5 {
            let location = cycle_location(Some(rank), &p, 2_345);
            let at_peak = cycle_location(Some(rank), &p, location.cycle_max_timestamp);
            assert_eq!(at_peak.phase_seconds, 500, "rank {rank}");
            assert_close(at_peak.allowance_fraction, max_allowance_fraction(5));
        }
    }

    #[test]
    fn fraction_stays_within_bounds_and_is_periodic() {
        let p = params(10, 3_600, 9);
        let ceiling = max_allowance_fraction(9);
        for now in (0..10_000).step_by(37) {
            let location = cycle_location(Some(4), &p, now);
            assert!(location.allowance_fraction >= 0.0);
            assert!(location.allowance_fraction <= ceiling + 1e-12);
            assert!(location.phase_radians < TAU);

            let next_cycle = cycle_location(Some(4), &p, now + 3_600);
            assert_close(next_cycle.allowance_fraction, location.allowance_fraction);
        }
    }

    #[test]
    fn time_before_start_wraps_into_previous_cycle() {
        let location = cycle_location(Some(1), &params(1_000, 400, 1), 900);
        assert_eq!(location.phase_seconds, 300);
        assert_eq!(moon_phase(location.phase_radians), MoonPhase::Waning);
        assert_eq!(peak_distance(&location, 400), PeakDistance::Since(100));
    }

    #[test]
    fn classifies_waxing_and_distance_to_peak() {
        let location = cycle_location(Some(1), &params(0, 400, 1), 100);
        assert_eq!(moon_phase(location.phase_radians), MoonPhase::Waxing);
        assert_eq!(peak_distance(&location, 400), PeakDistance::Until(100));
        assert_eq!(MoonPhase::Waxing.label(), "Waxing");
    }

    #[test]
    fn roster_lookup_uses_rank_and_size() {
        let alice = Address::repeat_byte(0x0a);
        let bob = Address::repeat_byte(0x0b);
        let stranger = Address::repeat_byte(0x0c);
        let roster = Roster::from_entries([
            RosterEntry {
                address: alice,
                rank: 1,
            },
            RosterEntry {
                address: bob,
                rank: 2,
            },
        ])
        .expect("valid roster");

        let bob_location = cycle_location_of(&roster, &bob, 0, 1_000, 0);
        assert_eq!(bob_location.rank_offset_seconds, 500);
        assert_close(bob_location.allowance_fraction, max_allowance_fraction(2));
        assert!(cycle_location_of(&roster, &stranger, 0, 1_000, 0).is_zero());
    }

    #[test]
    fn formats_countdown() {
        assert_eq!(format_countdown(93_784), "1d 02h 03m 04s");
        assert_eq!(format_countdown(59), "0d 00h 00m 59s");
    }
}
