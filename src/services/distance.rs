//! Distance engine: great-circle point distance and filtered path distance

use crate::domain::types::{Coordinate, GpsFix};
use serde::Serialize;

/// Mean Earth radius in km
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Half-width of the smoothing window (3-wide centered)
const SMOOTHING_HALF_WINDOW: usize = 1;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Great-circle distance in km
pub fn haversine(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Filter thresholds for path distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathOptions {
    pub max_speed_kmh: f64,
    pub min_distance_meters: f64,
    pub max_jump_km: f64,
    pub smoothing: bool,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self { max_speed_kmh: 200.0, min_distance_meters: 10.0, max_jump_km: 5.0, smoothing: true }
    }
}

/// An accepted segment between two consecutive fixes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub from: GpsFix,
    pub to: GpsFix,
    pub km: f64,
    pub speed_kmh: f64,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PathDistance {
    pub total_distance: f64,
    pub point_count: usize,
    pub valid_segments: usize,
    pub filtered_count: usize,
    pub avg_speed: f64,
    pub max_speed: f64,
    /// Empty when smoothing was applied
    pub segments: Vec<Segment>,
}

/// Why a segment was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentVerdict {
    Accepted,
    NonPositiveTime,
    Jump,
    Stationary,
    Overspeed,
}

fn judge(from: &GpsFix, to: &GpsFix, opts: &PathOptions) -> (SegmentVerdict, f64, f64) {
    let hours = (to.ts_ms - from.ts_ms) as f64 / MS_PER_HOUR;
    if hours <= 0.0 {
        return (SegmentVerdict::NonPositiveTime, 0.0, hours);
    }
    let km = haversine(from.coord, to.coord);
    if km > opts.max_jump_km {
        return (SegmentVerdict::Jump, km, hours);
    }
    if km * 1000.0 < opts.min_distance_meters {
        return (SegmentVerdict::Stationary, km, hours);
    }
    if km / hours > opts.max_speed_kmh {
        return (SegmentVerdict::Overspeed, km, hours);
    }
    (SegmentVerdict::Accepted, km, hours)
}

/// Travelled distance across a time-ordered trace, dropping implausible segments
///
/// Never fails: empty and single-point traces give a zero result.
pub fn path_distance(points: &[GpsFix], opts: &PathOptions) -> PathDistance {
    if points.len() < 2 {
        return PathDistance { point_count: points.len(), ..PathDistance::default() };
    }

    let mut segments = Vec::with_capacity(points.len() - 1);
    let mut filtered_count = 0;
    let mut max_speed: f64 = 0.0;
    let mut speed_sum = 0.0;

    for pair in points.windows(2) {
        let (verdict, km, hours) = judge(&pair[0], &pair[1], opts);
        if verdict != SegmentVerdict::Accepted {
            filtered_count += 1;
            continue;
        }
        let speed_kmh = km / hours;
        speed_sum += speed_kmh;
        max_speed = max_speed.max(speed_kmh);
        segments.push(Segment { from: pair[0], to: pair[1], km, speed_kmh, hours });
    }

    let valid_segments = segments.len();
    let raw_total: f64 = segments.iter().map(|s| s.km).sum();
    let smoothed = opts.smoothing && valid_segments >= 3;
    let total = if smoothed { smoothed_total(&segments) } else { raw_total };
    let avg_speed = if valid_segments > 0 { speed_sum / valid_segments as f64 } else { 0.0 };

    PathDistance {
        total_distance: round2(total),
        point_count: points.len(),
        valid_segments,
        filtered_count,
        avg_speed: round2(avg_speed),
        max_speed: round2(max_speed),
        segments: if opts.smoothing { Vec::new() } else { segments },
    }
}

/// Sum of a centered moving average over segment lengths, window truncated at the ends
fn smoothed_total(segments: &[Segment]) -> f64 {
    let n = segments.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(SMOOTHING_HALF_WINDOW);
            let hi = (i + SMOOTHING_HALF_WINDOW).min(n - 1);
            let window = &segments[lo..=hi];
            window.iter().map(|s| s.km).sum::<f64>() / window.len() as f64
        })
        .sum()
}

/// How a journey's distance was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMethod {
    PathDistance,
    StraightLine,
}

/// Tagged distance result, so degraded computation is visible downstream
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JourneyDistance {
    pub method: DistanceMethod,
    pub km: f64,
}

/// Path distance when the trace is rich enough, straight line otherwise
pub fn journey_distance(
    trace: &[GpsFix],
    entry: &GpsFix,
    exit: &GpsFix,
    opts: &PathOptions,
    min_path_points: usize,
) -> (JourneyDistance, Option<PathDistance>) {
    if trace.len() >= min_path_points.max(2) {
        let path = path_distance(trace, opts);
        if path.valid_segments > 0 {
            let distance = JourneyDistance { method: DistanceMethod::PathDistance, km: path.total_distance };
            return (distance, Some(path));
        }
    }
    let km = round2(haversine(entry.coord, exit.coord));
    (JourneyDistance { method: DistanceMethod::StraightLine, km }, None)
}

/// Estimated minutes to cover `distance_km`, using `current_kmh` when moving
pub fn eta_minutes(distance_km: f64, current_kmh: f64, fallback_kmh: f64) -> Option<f64> {
    let speed = if current_kmh > 5.0 { current_kmh } else { fallback_kmh };
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    Some(distance_km / speed * 60.0)
}

#[inline]
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lat: f64, lon: f64, secs: i64) -> GpsFix {
        GpsFix::new(lat, lon, 1_700_000_000_000 + secs * 1000)
    }

    #[test]
    fn test_haversine_known_distance() {
        // R = 6371 km gives 1.553 for this pair
        let d = haversine(Coordinate::new(12.9, 77.6), Coordinate::new(12.91, 77.61));
        assert!((d - 1.55).abs() <= 0.01, "got {d}");
    }

    #[test]
    fn test_haversine_zero_and_symmetric() {
        let a = Coordinate::new(11.0, 77.0);
        let b = Coordinate::new(11.5, 77.3);
        assert_eq!(haversine(a, a), 0.0);
        assert!((haversine(a, b) - haversine(b, a)).abs() < 1e-12);
    }

    #[test]
    fn test_empty_and_single_point() {
        let opts = PathOptions::default();
        let empty = path_distance(&[], &opts);
        assert_eq!(empty.total_distance, 0.0);
        assert_eq!(empty.valid_segments, 0);

        let single = path_distance(&[fix(11.0, 77.0, 0)], &opts);
        assert_eq!(single.total_distance, 0.0);
        assert_eq!(single.point_count, 1);
    }

    #[test]
    fn test_impossible_jump_filtered() {
        // ~50 km north in one minute
        let points = [fix(12.0, 77.0, 0), fix(12.45, 77.0, 60)];
        let result = path_distance(&points, &PathOptions { max_jump_km: 100.0, ..PathOptions::default() });
        assert_eq!(result.total_distance, 0.0);
        assert_eq!(result.filtered_count, 1);
        assert_eq!(result.valid_segments, 0);

        let result = path_distance(&points, &PathOptions::default());
        assert_eq!(result.total_distance, 0.0);
        assert_eq!(result.filtered_count, 1);
    }

    #[test]
    fn test_stationary_and_duplicate_timestamps_filtered() {
        let points = [
            fix(12.0, 77.0, 0),
            fix(12.00001, 77.0, 10), // ~1 m
            fix(12.01, 77.0, 10),    // same timestamp
            fix(12.01, 77.0, 5),     // reversed
        ];
        let result = path_distance(&points, &PathOptions::default());
        assert_eq!(result.valid_segments, 0);
        assert_eq!(result.filtered_count, 3);
    }

    #[test]
    fn test_raw_sum_keeps_segments() {
        let points = [fix(12.0, 77.0, 0), fix(12.01, 77.0, 60), fix(12.02, 77.0, 120)];
        let opts = PathOptions { smoothing: false, ..PathOptions::default() };
        let result = path_distance(&points, &opts);
        assert_eq!(result.valid_segments, 2);
        assert_eq!(result.segments.len(), 2);
        assert!((result.total_distance - 2.22).abs() < 0.02);
        assert!(result.max_speed > 60.0 && result.max_speed < 70.0);
    }

    #[test]
    fn test_smoothing_suppresses_segments() {
        let points = [
            fix(12.0, 77.0, 0),
            fix(12.01, 77.0, 60),
            fix(12.02, 77.0, 120),
            fix(12.03, 77.0, 180),
        ];
        let result = path_distance(&points, &PathOptions::default());
        assert_eq!(result.valid_segments, 3);
        assert!(result.segments.is_empty());
        // uniform segments: smoothing preserves the sum
        assert!((result.total_distance - 3.34).abs() < 0.02);
    }

    #[test]
    fn test_smoothing_dampens_spike() {
        let seg = |km: f64| Segment {
            from: fix(0.0, 0.0, 0),
            to: fix(0.0, 0.0, 1),
            km,
            speed_kmh: 0.0,
            hours: 1.0,
        };
        let segments = [seg(1.0), seg(4.0), seg(1.0)];
        // (2.5) + (2.0) + (2.5)
        assert!((smoothed_total(&segments) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_journey_distance_falls_back_to_straight_line() {
        let entry = fix(12.9, 77.6, 0);
        let exit = fix(12.91, 77.61, 120);
        let (d, path) = journey_distance(&[entry, exit], &entry, &exit, &PathOptions::default(), 3);
        assert_eq!(d.method, DistanceMethod::StraightLine);
        assert!(path.is_none());
        assert!((d.km - 1.55).abs() <= 0.01);
    }

    #[test]
    fn test_journey_distance_prefers_path() {
        let trace = [fix(12.0, 77.0, 0), fix(12.01, 77.0, 60), fix(12.02, 77.0, 120)];
        let (d, path) =
            journey_distance(&trace, &trace[0], &trace[2], &PathOptions::default(), 3);
        assert_eq!(d.method, DistanceMethod::PathDistance);
        assert_eq!(path.map(|p| p.valid_segments), Some(2));
    }

    #[test]
    fn test_journey_distance_all_filtered_falls_back() {
        let trace = [fix(12.0, 77.0, 0), fix(12.0, 77.0, 0), fix(12.0, 77.0, 0)];
        let (d, _) = journey_distance(&trace, &trace[0], &trace[2], &PathOptions::default(), 3);
        assert_eq!(d.method, DistanceMethod::StraightLine);
        assert_eq!(d.km, 0.0);
    }

    #[test]
    fn test_eta() {
        assert_eq!(eta_minutes(10.0, 60.0, 50.0), Some(10.0));
        assert_eq!(eta_minutes(10.0, 2.0, 50.0), Some(12.0));
        assert_eq!(eta_minutes(10.0, 0.0, 0.0), None);
    }
}
