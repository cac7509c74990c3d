use serde::{Deserialize, Serialize};

/// A pure function of time sampled by the pattern scheduler.
pub trait Waveform: Send + Sync {
    /// Seconds covered by the waveform's own domain, as `(start, end)`.
    fn time_range(&self) -> (f64, f64);

    fn sample(&self, t: f64) -> f64;

    /// Length of one loop. Zero means the waveform is constant in time.
    fn duration(&self) -> f64 {
        let (start, end) = self.time_range();
        (end - start).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveKey {
    pub time: f64,
    pub value: f64,
}

/// Piecewise-linear curve through its keys. Outside the keyed range the
/// nearest end value holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<CurveKey>", into = "Vec<CurveKey>")]
pub struct Curve {
    keys: Vec<CurveKey>,
}

impl Curve {
    pub fn new(mut keys: Vec<CurveKey>) -> Self {
        keys.retain(|key| key.time.is_finite() && key.value.is_finite());
        keys.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { keys }
    }

    /// Convenience for literal curves: `Curve::from_points(&[(0.0, 0.0), (1.0, 1.0)])`.
    pub fn from_points(points: &[(f64, f64)]) -> Self {
        Self::new(
            points
                .iter()
                .map(|&(time, value)| CurveKey { time, value })
                .collect(),
        )
    }

    pub fn keys(&self) -> &[CurveKey] {
        &self.keys
    }
}

impl From<Vec<CurveKey>> for Curve {
    fn from(keys: Vec<CurveKey>) -> Self {
        Self::new(keys)
    }
}

impl From<Curve> for Vec<CurveKey> {
    fn from(curve: Curve) -> Self {
        curve.keys
    }
}

impl Waveform for Curve {
    fn time_range(&self) -> (f64, f64) {
        match (self.keys.first(), self.keys.last()) {
            (Some(first), Some(last)) => (first.time, last.time),
            _ => (0.0, 0.0),
        }
    }

    fn sample(&self, t: f64) -> f64 {
        let (Some(first), Some(last)) = (self.keys.first(), self.keys.last()) else {
            return 0.0;
        };
        if t <= first.time {
            return first.value;
        }
        if t >= last.time {
            return last.value;
        }
        let upper = self.keys.partition_point(|key| key.time <= t);
        let (a, b) = (self.keys[upper - 1], self.keys[upper]);
        let span = b.time - a.time;
        if span <= 0.0 {
            return b.value;
        }
        a.value + (b.value - a.value) * (t - a.time) / span
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant(pub f64);

impl Waveform for Constant {
    fn time_range(&self) -> (f64, f64) {
        (0.0, 0.0)
    }

    fn sample(&self, _t: f64) -> f64 {
        self.0
    }
}

/// Samples `waveform` at `elapsed`, looping over its own domain, and clamps
/// the result to the normalized actuator range.
///
/// The loop position is measured from the start of the domain, so a curve
/// keyed over `[2, 4]` is read at `2 + elapsed mod 2`. For curves starting
/// at 0 this is plain `elapsed mod duration`.
pub fn sample_looped(waveform: &dyn Waveform, elapsed: f64) -> f64 {
    let (start, _) = waveform.time_range();
    let period = waveform.duration();
    let t = if period > 0.0 {
        start + elapsed.rem_euclid(period)
    } else {
        start
    };
    let value = waveform.sample(t);
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}
