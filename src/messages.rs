// Message types exchanged with the navigation stack over zenoh

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::link::{LinkStatus, TransportStats};

// Command from the navigation stack -> runtime (SI units)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdVel {
    /// m/s, positive = forward
    pub linear: f64,
    /// rad/s, positive = counter-clockwise
    pub angular: f64,
    /// Use the firmware speed controller; falls back to the configured default
    #[serde(default)]
    pub use_controller: Option<bool>,
}

/// A velocity request as issued to the command encoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityCommand {
    pub linear: f64,
    pub angular: f64,
    pub use_controller: bool,
    pub issued_at: Instant,
}

impl VelocityCommand {
    pub fn new(linear: f64, angular: f64) -> Self {
        Self {
            linear,
            angular,
            use_controller: true,
            issued_at: Instant::now(),
        }
    }

    /// Zero velocity, used by the watchdog and on shutdown
    pub fn stop() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn with_controller(mut self, use_controller: bool) -> Self {
        self.use_controller = use_controller;
        self
    }

    pub fn issued_at(mut self, at: Instant) -> Self {
        self.issued_at = at;
        self
    }

    pub fn from_cmd_vel(cmd: &CmdVel, default_use_controller: bool) -> Self {
        Self::new(cmd.linear, cmd.angular)
            .with_controller(cmd.use_controller.unwrap_or(default_use_controller))
    }
}

/// Pose output consumed by the navigation stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    /// Controller clock, seconds
    pub stamp: f64,
    pub x: f64,
    pub y: f64,
    /// rad, in (-pi, pi]
    pub heading: f64,
    /// m/s
    pub linear: f64,
    /// rad/s
    pub angular: f64,
    /// Row-major 3x3 covariance of (x, y, heading)
    pub pose_covariance: [f64; 9],
    /// Row-major 2x2 covariance of (linear, angular)
    pub twist_covariance: [f64; 4],
    /// Estimate comes from encoder-only dead reckoning after a divergence reset
    pub degraded: bool,
}

/// Firmware speed-controller diagnostics, forwarded as-is
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControllerReport {
    pub stamp: f64,
    /// m/s
    pub desired_velocity: f64,
    /// m/s
    pub actual_velocity: f64,
    pub error: f64,
    pub output: f64,
    /// rad/s
    pub yaw_rate: f64,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    TelemetryStale,
    Degraded,
    LinkDown,
}

/// Health snapshot published every tick
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub health: RuntimeHealth,
    pub link: LinkStatus,
    pub transport: TransportStats,
    pub pipeline: PipelineCounters,
}

/// Drops and rejections accumulated along the telemetry path
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipelineCounters {
    pub frames: u64,
    pub checksum_errors: u64,
    pub malformed_payloads: u64,
    pub stale_samples: u64,
    pub queue_overflows: u64,
    pub estimates: u64,
    pub gated_measurements: u64,
    pub divergence_resets: u64,
    /// Predictions made without a sample
    pub coasts: u64,
    /// Trace of the current state covariance
    pub covariance_trace: f64,
}
