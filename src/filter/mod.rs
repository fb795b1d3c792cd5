// Signal filter module
// Turns noisy GPS fixes into stable local 3D positions
//
// Pipeline: reference projection -> per-axis Kalman (X, Z) -> optional moving average.
// Y is held at 0 for GPS input.

pub mod average;
pub mod kalman;

use serde::{Deserialize, Serialize};

use crate::constants::{
    ACCURACY_EXCELLENT_M, ACCURACY_FAIR_M, ACCURACY_GOOD_M, DEFAULT_AVERAGE_WINDOW,
    DEFAULT_MEASUREMENT_NOISE, DEFAULT_PROCESS_NOISE,
};
use crate::geodesy::{self, ReferencePoint};
use crate::record::Position3D;

pub use average::MovingAverage;
pub use kalman::AxisKalman;

/// Which stages run after projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Projection only
    Raw,
    /// Per-axis Kalman
    #[default]
    Kalman,
    /// Moving average of raw projections
    Average,
    /// Kalman followed by moving average
    Hybrid,
}

/// Informational accuracy grade; never used to drop data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccuracyClass {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl AccuracyClass {
    pub fn classify(accuracy: f64) -> Self {
        if accuracy <= ACCURACY_EXCELLENT_M {
            AccuracyClass::Excellent
        } else if accuracy <= ACCURACY_GOOD_M {
            AccuracyClass::Good
        } else if accuracy <= ACCURACY_FAIR_M {
            AccuracyClass::Fair
        } else {
            AccuracyClass::Poor
        }
    }
}

/// Tuning for a [`SignalFilter`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub mode: FilterMode,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub average_window: usize,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            mode: FilterMode::Kalman,
            process_noise: DEFAULT_PROCESS_NOISE,
            measurement_noise: DEFAULT_MEASUREMENT_NOISE,
            average_window: DEFAULT_AVERAGE_WINDOW,
        }
    }
}

/// Everything a filter remembers between samples.
///
/// Only meaningful relative to `reference`; a new reference means a fresh state.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub x: AxisKalman,
    pub z: AxisKalman,
    pub window: MovingAverage,
    pub reference: ReferencePoint,
}

impl FilterState {
    pub fn new(params: &FilterParams, reference: ReferencePoint) -> Self {
        Self {
            x: AxisKalman::new(params.process_noise, params.measurement_noise),
            z: AxisKalman::new(params.process_noise, params.measurement_noise),
            window: MovingAverage::new(params.average_window),
            reference,
        }
    }

    fn reset(&mut self) {
        self.x.reset();
        self.z.reset();
        self.window.clear();
    }
}

/// Raw GPS input to the filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

/// Pure form of the filter: consumes the prior state and returns the new one
pub fn filter(
    sample: &GpsSample,
    prior: FilterState,
    params: &FilterParams,
) -> (Position3D, FilterState) {
    let mut state = prior;
    let raw = geodesy::to_local(&state.reference, sample.latitude, sample.longitude);
    let smoothed = smooth(params.mode, &mut state, raw);
    (smoothed, state)
}

fn smooth(mode: FilterMode, state: &mut FilterState, raw: Position3D) -> Position3D {
    match mode {
        FilterMode::Raw => raw,
        FilterMode::Kalman => kalman_step(state, raw),
        FilterMode::Average => state.window.push(raw),
        FilterMode::Hybrid => {
            let k = kalman_step(state, raw);
            state.window.push(k)
        }
    }
}

fn kalman_step(state: &mut FilterState, raw: Position3D) -> Position3D {
    Position3D {
        x: state.x.update(raw.x),
        y: 0.0,
        z: state.z.update(raw.z),
    }
}

/// Stateful filter owned by one tracking source
#[derive(Debug, Clone)]
pub struct SignalFilter {
    params: FilterParams,
    state: FilterState,
}

impl SignalFilter {
    pub fn new(params: FilterParams, reference: ReferencePoint) -> Self {
        Self {
            state: FilterState::new(&params, reference),
            params,
        }
    }

    /// Project and smooth one GPS sample
    pub fn process(&mut self, sample: &GpsSample) -> Position3D {
        let raw = geodesy::to_local(&self.state.reference, sample.latitude, sample.longitude);
        smooth(self.params.mode, &mut self.state, raw)
    }

    /// Switch to a new origin. Any change wipes the Kalman estimates and the window.
    ///
    /// Returns true when the reference actually changed.
    pub fn set_reference(&mut self, reference: ReferencePoint) -> bool {
        if reference == self.state.reference {
            return false;
        }
        self.state.reference = reference;
        self.reset();
        true
    }

    /// Drop all history but keep the current reference
    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn reference(&self) -> ReferencePoint {
        self.state.reference
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(latitude: f64, longitude: f64) -> GpsSample {
        GpsSample { latitude, longitude, accuracy: 4.0 }
    }

    #[test]
    fn test_accuracy_classes() {
        assert_eq!(AccuracyClass::classify(0.0), AccuracyClass::Excellent);
        assert_eq!(AccuracyClass::classify(5.0), AccuracyClass::Excellent);
        assert_eq!(AccuracyClass::classify(5.1), AccuracyClass::Good);
        assert_eq!(AccuracyClass::classify(10.0), AccuracyClass::Good);
        assert_eq!(AccuracyClass::classify(20.0), AccuracyClass::Fair);
        assert_eq!(AccuracyClass::classify(20.5), AccuracyClass::Poor);
    }

    #[test]
    fn test_reference_sample_is_origin() {
        let mut f = SignalFilter::new(FilterParams::default(), ReferencePoint::default());
        let out = f.process(&fix(37.563517, 127.079571));
        assert!(out.x.abs() < 1e-9 && out.z.abs() < 1e-9);
        assert_eq!(out.y, 0.0);
    }

    #[test]
    fn test_one_update_lands_between_zero_and_raw() {
        let mut f = SignalFilter::new(FilterParams::default(), ReferencePoint::default());
        let out = f.process(&fix(37.563608, 127.079571));
        let raw_z = (37.563608 - 37.563517) * crate::constants::LAT_TO_Z;
        assert!(raw_z < -10.0 && raw_z > -10.2);
        assert!(out.z < 0.0 && out.z > raw_z, "smoothed z {} not in ({}, 0)", out.z, raw_z);
    }

    #[test]
    fn test_raw_mode_is_projection() {
        let params = FilterParams { mode: FilterMode::Raw, ..Default::default() };
        let reference = ReferencePoint::default();
        let mut f = SignalFilter::new(params, reference);
        let out = f.process(&fix(37.5636, 127.0797));
        assert_eq!(out, geodesy::to_local(&reference, 37.5636, 127.0797));
    }

    #[test]
    fn test_hybrid_averages_kalman_output() {
        let params = FilterParams { mode: FilterMode::Hybrid, ..Default::default() };
        let reference = ReferencePoint::default();
        let mut hybrid = SignalFilter::new(params, reference);
        let mut kalman = SignalFilter::new(FilterParams::default(), reference);

        let samples = [fix(37.5636, 127.0797), fix(37.5637, 127.0796), fix(37.5635, 127.0798)];
        let mut kalman_outputs = Vec::new();
        let mut last = Position3D::default();
        for s in &samples {
            kalman_outputs.push(kalman.process(s));
            last = hybrid.process(s);
        }
        let mean_z = kalman_outputs.iter().map(|p| p.z).sum::<f64>() / 3.0;
        assert!((last.z - mean_z).abs() < 1e-9);
        assert_eq!(hybrid.state().window.len(), 3);
    }

    #[test]
    fn test_reference_change_forgets_history() {
        let params = FilterParams { mode: FilterMode::Hybrid, ..Default::default() };
        let mut used = SignalFilter::new(params, ReferencePoint::default());
        for i in 0..10 {
            used.process(&fix(37.5640 + i as f64 * 1e-5, 127.0800));
        }

        let new_ref = ReferencePoint::new(37.5, 127.0).unwrap();
        assert!(used.set_reference(new_ref));
        assert!(!used.set_reference(new_ref));

        let mut fresh = SignalFilter::new(params, new_ref);
        let probe = fix(37.5001, 127.0002);
        assert_eq!(used.process(&probe), fresh.process(&probe));
        assert_eq!(used.state(), fresh.state());
    }

    #[test]
    fn test_reset_keeps_reference() {
        let reference = ReferencePoint::new(37.5, 127.0).unwrap();
        let params = FilterParams { mode: FilterMode::Hybrid, ..Default::default() };
        let mut f = SignalFilter::new(params, reference);
        for i in 0..4 {
            f.process(&fix(37.5001 + i as f64 * 1e-5, 127.0001));
        }
        assert_ne!(f.state(), &FilterState::new(&params, reference));

        f.reset();
        assert_eq!(f.reference(), reference);
        assert_eq!(f.state(), &FilterState::new(&params, reference));
    }

    #[test]
    fn test_pure_filter_matches_stateful() {
        let params = FilterParams::default();
        let reference = ReferencePoint::default();
        let mut stateful = SignalFilter::new(params, reference);
        let mut state = FilterState::new(&params, reference);

        for s in [fix(37.5636, 127.0797), fix(37.5637, 127.0796)] {
            let (out, next) = filter(&s, state, &params);
            state = next;
            assert_eq!(out, stateful.process(&s));
        }
        assert_eq!(&state, stateful.state());
    }
}
