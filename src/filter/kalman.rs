// Scalar Kalman filter for one position axis
//
// Random-walk model: predict inflates the covariance by Q, update blends the
// measurement in by the gain P / (P + R) and shrinks P by (1 - gain).

use crate::constants::{
    DEFAULT_MEASUREMENT_NOISE, DEFAULT_PROCESS_NOISE, INITIAL_COVARIANCE, INITIAL_ESTIMATE,
};

/// Kalman state for a single axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisKalman {
    estimate: f64,
    error_covariance: f64,
    process_noise: f64,
    measurement_noise: f64,
}

impl AxisKalman {
    /// Create a filter at estimate 0, covariance 1
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            estimate: INITIAL_ESTIMATE,
            error_covariance: INITIAL_COVARIANCE,
            process_noise,
            measurement_noise,
        }
    }

    /// Feed one measurement and return the new estimate
    pub fn update(&mut self, measurement: f64) -> f64 {
        // Predict
        self.error_covariance += self.process_noise;

        // Update
        let gain = self.gain();
        self.estimate += gain * (measurement - self.estimate);
        self.error_covariance *= 1.0 - gain;

        self.estimate
    }

    /// Gain the next update would use, after prediction
    fn gain(&self) -> f64 {
        self.error_covariance / (self.error_covariance + self.measurement_noise)
    }

    /// Return to the initial state, keeping the noise parameters
    pub fn reset(&mut self) {
        self.estimate = INITIAL_ESTIMATE;
        self.error_covariance = INITIAL_COVARIANCE;
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    pub fn error_covariance(&self) -> f64 {
        self.error_covariance
    }

    pub fn process_noise(&self) -> f64 {
        self.process_noise
    }

    pub fn measurement_noise(&self) -> f64 {
        self.measurement_noise
    }
}

impl Default for AxisKalman {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESS_NOISE, DEFAULT_MEASUREMENT_NOISE)
    }
}
