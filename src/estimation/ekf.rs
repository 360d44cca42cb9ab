// Extended Kalman filter over a planar differential-drive base
//
// State: [x, y, heading, v, omega]
// - prediction is driven by wheel encoder increments (odometry as control input)
// - correction uses the gyro yaw rate as a measurement of omega
// - covariance blow-up falls back to encoder-only dead reckoning

use nalgebra::{SMatrix, SVector};
use tracing::{debug, info, warn};

use super::kinematics::{DiffDrive, WheelTravel, normalize_angle};
use crate::config::EstimatorConfig;
use crate::link::TelemetrySample;

pub const N: usize = 5;

pub const X: usize = 0;
pub const Y: usize = 1;
pub const HEADING: usize = 2;
pub const LINEAR: usize = 3;
pub const ANGULAR: usize = 4;

pub type Mat<const R: usize, const C: usize> = SMatrix<f64, R, C>;
pub type StateVector = SVector<f64, N>;
pub type StateCovariance = Mat<N, N>;

/// Filter state; only `StateEstimator` can change it
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorState {
    x: StateVector,
    p: StateCovariance,
}

impl EstimatorState {
    fn initial(variance: f64) -> Self {
        Self {
            x: StateVector::zeros(),
            p: StateCovariance::identity() * variance,
        }
    }

    pub fn vector(&self) -> &StateVector {
        &self.x
    }

    pub fn covariance(&self) -> &StateCovariance {
        &self.p
    }

    pub fn trace(&self) -> f64 {
        self.p.trace()
    }
}

/// Immutable snapshot produced by every update
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEstimate {
    /// Source clock, seconds
    pub stamp: f64,
    pub state: StateVector,
    pub covariance: StateCovariance,
    pub degraded: bool,
}

impl PoseEstimate {
    pub fn x(&self) -> f64 {
        self.state[X]
    }

    pub fn y(&self) -> f64 {
        self.state[Y]
    }

    pub fn heading(&self) -> f64 {
        self.state[HEADING]
    }

    pub fn linear(&self) -> f64 {
        self.state[LINEAR]
    }

    pub fn angular(&self) -> f64 {
        self.state[ANGULAR]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fusing,
    /// Encoder-only after a divergence reset, for this many more samples
    DeadReckoning { remaining: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimatorStats {
    pub updates: u64,
    pub corrections: u64,
    pub gated: u64,
    pub resets: u64,
    pub coasts: u64,
}

pub struct StateEstimator {
    config: EstimatorConfig,
    drive: DiffDrive,
    state: EstimatorState,
    mode: Mode,
    last_stamp: Option<f64>,
    /// State before the first coast step since the last update
    coast_anchor: Option<StateVector>,
    stats: EstimatorStats,
}

impl StateEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let drive = DiffDrive::new(config.wheel_base, config.distance_per_tick);
        let state = EstimatorState::initial(config.initial_variance);
        Self {
            config,
            drive,
            state,
            mode: Mode::Fusing,
            last_stamp: None,
            coast_anchor: None,
            stats: EstimatorStats::default(),
        }
    }

    pub fn state(&self) -> &EstimatorState {
        &self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_degraded(&self) -> bool {
        self.mode != Mode::Fusing
    }

    pub fn stats(&self) -> EstimatorStats {
        self.stats
    }

    /// Coast at constant velocity for `dt` seconds without measurements.
    ///
    /// Coasted motion is provisional: the next `update` restarts from the
    /// last measured pose and integrates the encoders over the whole gap,
    /// keeping only the uncertainty accumulated here.
    pub fn predict(&mut self, dt: f64) {
        if !(dt > 0.0) {
            return;
        }
        let dt = dt.min(self.config.max_dt);
        if self.coast_anchor.is_none() {
            self.coast_anchor = Some(self.state.x);
        }

        let x = self.state.x;
        let (theta, v, w) = (x[HEADING], x[LINEAR], x[ANGULAR]);
        let distance = v * dt;
        let rotation = w * dt;
        let mid = theta + rotation / 2.0;
        let (sin, cos) = mid.sin_cos();

        self.state.x[X] += distance * cos;
        self.state.x[Y] += distance * sin;
        self.state.x[HEADING] = normalize_angle(theta + rotation);

        let mut f = StateCovariance::identity();
        f[(X, HEADING)] = -distance * sin;
        f[(X, LINEAR)] = dt * cos;
        f[(X, ANGULAR)] = -distance * sin * dt / 2.0;
        f[(Y, HEADING)] = distance * cos;
        f[(Y, LINEAR)] = dt * sin;
        f[(Y, ANGULAR)] = distance * cos * dt / 2.0;
        f[(HEADING, ANGULAR)] = dt;

        let p = f * self.state.p * f.transpose() + self.process_noise(dt);
        self.state.p = symmetrize(p);
        self.stats.coasts += 1;

        self.check_divergence();
    }

    /// Fold one sample into the estimate
    pub fn update(&mut self, sample: &TelemetrySample) -> PoseEstimate {
        if let Some(anchor) = self.coast_anchor.take() {
            self.state.x = anchor;
        }

        let dt = match self.last_stamp {
            Some(prev) => (sample.stamp - prev).clamp(0.0, self.config.max_dt),
            None => 0.0,
        };

        let travel = self.drive.wheel_travel(sample.left_ticks, sample.right_ticks);
        self.propagate(travel, dt);

        let dead_reckoned = match self.mode {
            Mode::Fusing => {
                self.correct_yaw_rate(sample.angular_velocity.z);
                false
            }
            Mode::DeadReckoning { remaining } => {
                if remaining > 1 {
                    self.mode = Mode::DeadReckoning {
                        remaining: remaining - 1,
                    };
                } else {
                    info!("Resuming gyro fusion after dead reckoning");
                    self.mode = Mode::Fusing;
                }
                true
            }
        };

        self.check_divergence();
        self.last_stamp = Some(sample.stamp);
        self.stats.updates += 1;

        PoseEstimate {
            stamp: sample.stamp,
            state: self.state.x,
            covariance: self.state.p,
            degraded: dead_reckoned || self.is_degraded(),
        }
    }

    /// Odometry prediction: encoder travel is the control input
    fn propagate(&mut self, travel: WheelTravel, dt: f64) {
        let inc = self.drive.body_increment(travel);
        let b = self.drive.wheel_base;
        let theta = self.state.x[HEADING];
        let mid = theta + inc.rotation / 2.0;
        let (sin, cos) = mid.sin_cos();
        let ds = inc.distance;

        self.state.x[X] += ds * cos;
        self.state.x[Y] += ds * sin;
        self.state.x[HEADING] = normalize_angle(theta + inc.rotation);

        // Jacobian w.r.t. the state
        let mut f = StateCovariance::identity();
        f[(X, HEADING)] = -ds * sin;
        f[(Y, HEADING)] = ds * cos;

        // Jacobian w.r.t. the wheel travel (left, right)
        let mut g = Mat::<N, 2>::zeros();
        g[(X, 0)] = 0.5 * cos + ds * sin / (2.0 * b);
        g[(X, 1)] = 0.5 * cos - ds * sin / (2.0 * b);
        g[(Y, 0)] = 0.5 * sin - ds * cos / (2.0 * b);
        g[(Y, 1)] = 0.5 * sin + ds * cos / (2.0 * b);
        g[(HEADING, 0)] = -1.0 / b;
        g[(HEADING, 1)] = 1.0 / b;

        if dt > 0.0 {
            // velocities are replaced by the encoder-derived ones
            self.state.x[LINEAR] = ds / dt;
            self.state.x[ANGULAR] = inc.rotation / dt;
            f[(LINEAR, LINEAR)] = 0.0;
            f[(ANGULAR, ANGULAR)] = 0.0;
            g[(LINEAR, 0)] = 0.5 / dt;
            g[(LINEAR, 1)] = 0.5 / dt;
            g[(ANGULAR, 0)] = -1.0 / (b * dt);
            g[(ANGULAR, 1)] = 1.0 / (b * dt);
        }

        let u = Mat::<2, 2>::from_diagonal(&SVector::<f64, 2>::new(
            self.wheel_variance(travel.left),
            self.wheel_variance(travel.right),
        ));

        let p = f * self.state.p * f.transpose() + g * u * g.transpose() + self.process_noise(dt);
        self.state.p = symmetrize(p);
    }

    /// Gated scalar update of omega with the gyro yaw rate.
    /// Returns false when the measurement was rejected as an outlier.
    fn correct_yaw_rate(&mut self, measured: f64) -> bool {
        let r = self.config.gyro_variance;
        let innovation = measured - self.state.x[ANGULAR];
        let s = self.state.p[(ANGULAR, ANGULAR)] + r;

        let gate = self.config.gate_sigma;
        if !innovation.is_finite() || innovation * innovation > gate * gate * s {
            self.stats.gated += 1;
            debug!(
                "Rejecting yaw rate {:.4}: innovation {:.4} beyond {:.1} sigma",
                measured, innovation, gate
            );
            return false;
        }

        let k = self.state.p.column(ANGULAR).into_owned() / s;
        let mut h = Mat::<1, N>::zeros();
        h[(0, ANGULAR)] = 1.0;

        self.state.x += k * innovation;
        self.state.x[HEADING] = normalize_angle(self.state.x[HEADING]);

        // Joseph form keeps P positive semi-definite
        let i_kh = StateCovariance::identity() - k * h;
        let p = i_kh * self.state.p * i_kh.transpose() + k * r * k.transpose();
        self.state.p = symmetrize(p);
        self.stats.corrections += 1;
        true
    }

    fn check_divergence(&mut self) {
        let trace = self.state.trace();
        if trace.is_finite() && trace <= self.config.covariance_ceiling {
            return;
        }

        warn!(
            "Covariance trace {:.3e} exceeds ceiling {:.3e}, falling back to dead reckoning",
            trace, self.config.covariance_ceiling
        );
        // keep the pose, drop the unreliable velocity estimate if it blew up
        if !self.state.x.iter().all(|v| v.is_finite()) {
            let keep = self.coast_anchor.unwrap_or_else(StateVector::zeros);
            self.state.x = keep;
        }
        self.state.p = StateCovariance::identity() * self.config.initial_variance;
        self.stats.resets += 1;
        self.mode = if self.config.recovery_samples > 0 {
            Mode::DeadReckoning {
                remaining: self.config.recovery_samples,
            }
        } else {
            Mode::Fusing
        };
    }

    fn wheel_variance(&self, travel: f64) -> f64 {
        self.config.wheel_noise * travel.abs() + self.config.wheel_noise_floor
    }

    fn process_noise(&self, dt: f64) -> StateCovariance {
        let q = &self.config.process_noise;
        StateCovariance::from_diagonal(&StateVector::from([
            q.position, q.position, q.heading, q.linear, q.angular,
        ])) * dt
    }
}

fn symmetrize(p: StateCovariance) -> StateCovariance {
    (p + p.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessNoise;
    use nalgebra::Vector3;

    fn sample(stamp: f64, yaw_rate: f64, left: i64, right: i64) -> TelemetrySample {
        TelemetrySample {
            raw_stamp: (stamp * 1000.0).round() as u32,
            stamp,
            angular_velocity: Vector3::new(0.0, 0.0, yaw_rate),
            linear_acceleration: None,
            left_ticks: left,
            right_ticks: right,
        }
    }

    fn is_psd(p: &StateCovariance) -> bool {
        p.symmetric_eigenvalues().iter().all(|&e| e > -1e-12)
    }

    #[test]
    fn test_initial_state() {
        let config = EstimatorConfig::default();
        let est = StateEstimator::new(config.clone());
        assert_eq!(est.state().vector(), &StateVector::zeros());
        assert!((est.state().trace() - 5.0 * config.initial_variance).abs() < 1e-12);
        assert!(!est.is_degraded());
    }

    #[test]
    fn test_straight_drive_follows_encoders() {
        let mut est = StateEstimator::new(EstimatorConfig::default());
        est.update(&sample(0.0, 0.0, 0, 0));
        let mut last = None;
        for i in 1..=10 {
            // 20 ticks per wheel every 100 ms -> 0.2 m/s
            last = Some(est.update(&sample(i as f64 * 0.1, 0.0, 20, 20)));
        }
        let pose = last.unwrap();
        assert!((pose.x() - 0.2).abs() < 1e-9, "x = {}", pose.x());
        assert!(pose.y().abs() < 1e-9);
        assert!(pose.heading().abs() < 1e-9);
        assert!((pose.linear() - 0.2).abs() < 1e-9);
        assert!(is_psd(&pose.covariance));
    }

    #[test]
    fn test_gyro_pulls_heading() {
        let mut est = StateEstimator::new(EstimatorConfig::default());
        let first = est.update(&sample(1.0, 0.1, 0, 0));
        let second = est.update(&sample(1.05, 0.1, 10, 10));

        assert_eq!(first.heading(), 0.0);
        assert!(second.heading() > first.heading());
        assert!(second.angular() > 0.0);
        assert!((second.x() - 0.01).abs() < 1e-9);
        assert_eq!(est.stats().corrections, 2);
    }

    #[test]
    fn test_outlier_rejected() {
        let config = EstimatorConfig::default();
        let mut est = StateEstimator::new(config.clone());
        for i in 0..20 {
            est.update(&sample(i as f64 * 0.05, 0.0, 10, 10));
        }
        let before = est.state().clone();

        // a spike far beyond the gate
        let pose = est.update(&sample(1.0, 50.0, 10, 10));
        assert_eq!(est.stats().gated, 1);
        assert!(pose.angular().abs() < 1e-6);
        assert!(pose.covariance.trace() < config.covariance_ceiling);
        assert!(!pose.degraded);
        // the spike didn't shrink the uncertainty either
        assert!(pose.covariance[(ANGULAR, ANGULAR)] >= before.covariance()[(ANGULAR, ANGULAR)] - 1e-12);
    }

    #[test]
    fn test_divergence_resets_to_dead_reckoning() {
        let config = EstimatorConfig {
            process_noise: ProcessNoise {
                linear: 50.0,
                ..ProcessNoise::default()
            },
            covariance_ceiling: 20.0,
            recovery_samples: 2,
            ..EstimatorConfig::default()
        };
        let mut est = StateEstimator::new(config.clone());
        est.update(&sample(0.0, 0.0, 0, 0));

        // stalled telemetry: coasting inflates the covariance past the ceiling
        est.predict(0.5);
        assert_eq!(est.stats().resets, 1);
        assert!(est.is_degraded());
        assert!((est.state().trace() - 5.0 * config.initial_variance).abs() < 1e-9);

        // gyro is ignored while dead reckoning
        let a = est.update(&sample(0.1, 0.4, 10, 10));
        assert!(a.degraded);
        assert_eq!(a.angular(), 0.0);
        let b = est.update(&sample(0.2, 0.0, 10, 10));
        assert!(b.degraded);
        let c = est.update(&sample(0.3, 0.0, 10, 10));
        assert!(!c.degraded);
        assert!(c.x() > b.x() && b.x() > a.x());
    }

    #[test]
    fn test_coast_is_provisional() {
        let mut est = StateEstimator::new(EstimatorConfig::default());
        est.update(&sample(0.0, 0.0, 0, 0));
        est.update(&sample(0.1, 0.0, 20, 20));
        let trace_before = est.state().trace();

        est.predict(0.1);
        est.predict(0.1);
        assert!(est.state().vector()[X] > 0.02 + 1e-6);
        assert!(est.state().trace() > trace_before);

        // the encoders cover the whole gap, the coasted guess is discarded
        let pose = est.update(&sample(0.3, 0.0, 40, 40));
        assert!((pose.x() - 0.06).abs() < 1e-9);
        assert!((pose.linear() - 0.2).abs() < 1e-9);
        assert_eq!(est.stats().coasts, 2);
    }

    #[test]
    fn test_predict_ignores_non_positive_dt() {
        let mut est = StateEstimator::new(EstimatorConfig::default());
        let before = est.state().clone();
        est.predict(0.0);
        est.predict(-1.0);
        est.predict(f64::NAN);
        assert_eq!(est.state(), &before);
    }

    #[test]
    fn test_deterministic() {
        let run = || {
            let mut est = StateEstimator::new(EstimatorConfig::default());
            (0..50)
                .map(|i| {
                    let t = i as f64 * 0.02;
                    est.update(&sample(t, (t * 3.0).sin(), 5 + i % 3, 7 - i % 2))
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_turning_covariance_stays_psd() {
        let mut est = StateEstimator::new(EstimatorConfig::default());
        for i in 0..200 {
            let pose = est.update(&sample(i as f64 * 0.02, 0.5, 8, 12));
            assert!(is_psd(&pose.covariance), "step {i}");
            assert!(pose.heading() > -std::f64::consts::PI && pose.heading() <= std::f64::consts::PI);
        }
    }
}
