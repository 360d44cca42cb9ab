// Odometry publisher: estimates -> pose records for the navigation stack

use tracing::trace;

use super::ekf::{ANGULAR, HEADING, LINEAR, PoseEstimate, X, Y};
use crate::messages::PoseRecord;

#[derive(Debug, Default)]
pub struct OdometryPublisher {
    last_stamp: Option<f64>,
    emitted: u64,
    duplicates: u64,
}

impl OdometryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Package an estimate, or `None` if it repeats the last emitted timestamp
    pub fn on_estimate(&mut self, estimate: &PoseEstimate) -> Option<PoseRecord> {
        if self.last_stamp == Some(estimate.stamp) {
            self.duplicates += 1;
            trace!("Suppressing duplicate pose at t={:.3}", estimate.stamp);
            return None;
        }
        self.last_stamp = Some(estimate.stamp);
        self.emitted += 1;
        Some(to_record(estimate))
    }
}

pub fn to_record(estimate: &PoseEstimate) -> PoseRecord {
    let p = &estimate.covariance;

    let pose = [X, Y, HEADING];
    let mut pose_covariance = [0.0; 9];
    for (r, &i) in pose.iter().enumerate() {
        for (c, &j) in pose.iter().enumerate() {
            pose_covariance[r * 3 + c] = p[(i, j)];
        }
    }

    let twist = [LINEAR, ANGULAR];
    let mut twist_covariance = [0.0; 4];
    for (r, &i) in twist.iter().enumerate() {
        for (c, &j) in twist.iter().enumerate() {
            twist_covariance[r * 2 + c] = p[(i, j)];
        }
    }

    PoseRecord {
        stamp: estimate.stamp,
        x: estimate.x(),
        y: estimate.y(),
        heading: estimate.heading(),
        linear: estimate.linear(),
        angular: estimate.angular(),
        pose_covariance,
        twist_covariance,
        degraded: estimate.degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::ekf::{StateCovariance, StateVector};

    fn estimate(stamp: f64) -> PoseEstimate {
        let mut covariance = StateCovariance::zeros();
        for i in 0..5 {
            for j in 0..5 {
                covariance[(i, j)] = (i * 10 + j) as f64;
            }
        }
        PoseEstimate {
            stamp,
            state: StateVector::from([1.0, 2.0, 0.5, 0.2, -0.1]),
            covariance,
            degraded: false,
        }
    }

    #[test]
    fn test_record_layout() {
        let record = to_record(&estimate(3.5));
        assert_eq!(record.stamp, 3.5);
        assert_eq!((record.x, record.y, record.heading), (1.0, 2.0, 0.5));
        assert_eq!((record.linear, record.angular), (0.2, -0.1));
        assert_eq!(
            record.pose_covariance,
            [0.0, 1.0, 2.0, 10.0, 11.0, 12.0, 20.0, 21.0, 22.0]
        );
        assert_eq!(record.twist_covariance, [33.0, 34.0, 43.0, 44.0]);
    }

    #[test]
    fn test_duplicate_stamp_suppressed() {
        let mut publisher = OdometryPublisher::new();
        assert!(publisher.on_estimate(&estimate(1.0)).is_some());
        assert!(publisher.on_estimate(&estimate(1.0)).is_none());
        assert!(publisher.on_estimate(&estimate(1.05)).is_some());
        assert_eq!(publisher.emitted(), 2);
        assert_eq!(publisher.duplicates(), 1);
    }
}
