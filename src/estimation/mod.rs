// Pose estimation for the differential-drive base
//
// Provides:
// - Wheel odometry kinematics
// - EKF fusing encoder odometry with the gyro yaw rate
// - Pose record packaging for the navigation stack

pub mod ekf;
pub mod kinematics;
pub mod odometry;

pub use ekf::{EstimatorState, EstimatorStats, Mode, PoseEstimate, StateEstimator};
pub use kinematics::{DiffDrive, normalize_angle};
pub use odometry::OdometryPublisher;
