// Telemetry decoder: inbound frame payloads -> structured samples
//
// Sample payload (little-endian):
//   [Kind=0x10, Flags, Stamp(u32), Gyro(i32 x3), Accel(i32 x3, if Flags bit 0),
//    EncLeft(i32), EncRight(i32)]
// Controller report payload:
//   [Kind=0x11, Reserved, Stamp(u32), Desired(i32), Actual(i32), Error(i32),
//    Output(i32), GyroZ(i32)]

use bytes::Buf;
use nalgebra::Vector3;
use std::time::Instant;
use tracing::{debug, info, trace};

use super::codec::Frame;
use crate::config::{EncoderConvention, TelemetryConfig};
use crate::messages::ControllerReport;

pub const KIND_SAMPLE: u8 = 0x10;
pub const KIND_CONTROLLER: u8 = 0x11;
pub const FLAG_HAS_ACCEL: u8 = 0x01;

pub const SAMPLE_LEN: usize = 26;
pub const SAMPLE_WITH_ACCEL_LEN: usize = 38;
pub const CONTROLLER_LEN: usize = 26;

/// One inertial/encoder reading from the controller
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    /// Source clock ticks
    pub raw_stamp: u32,
    /// Source clock, seconds, unwrapped and continued across controller restarts
    pub stamp: f64,
    /// rad/s
    pub angular_velocity: Vector3<f64>,
    /// m/s^2
    pub linear_acceleration: Option<Vector3<f64>>,
    /// Encoder ticks since the previous accepted sample
    pub left_ticks: i64,
    pub right_ticks: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Sample(TelemetrySample),
    Controller(ControllerReport),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Empty payload")]
    Empty,

    #[error("Unknown message kind 0x{0:02X}")]
    UnknownKind(u8),

    #[error("Message 0x{kind:02X} should be {expected} bytes, got {actual}")]
    Length {
        kind: u8,
        expected: usize,
        actual: usize,
    },
}

/// Fields exactly as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub stamp: u32,
    pub gyro: [i32; 3],
    pub accel: Option<[i32; 3]>,
    pub enc_left: i32,
    pub enc_right: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawControllerReport {
    pub stamp: u32,
    pub desired: i32,
    pub actual: i32,
    pub error: i32,
    pub output: i32,
    pub gyro_z: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTelemetry {
    Sample(RawSample),
    Controller(RawControllerReport),
}

impl RawSample {
    /// Serialize as the firmware does
    pub fn encode(&self) -> Vec<u8> {
        let flags = if self.accel.is_some() { FLAG_HAS_ACCEL } else { 0 };
        let mut out = Vec::with_capacity(SAMPLE_WITH_ACCEL_LEN);
        out.push(KIND_SAMPLE);
        out.push(flags);
        out.extend_from_slice(&self.stamp.to_le_bytes());
        for g in self.gyro {
            out.extend_from_slice(&g.to_le_bytes());
        }
        if let Some(accel) = self.accel {
            for a in accel {
                out.extend_from_slice(&a.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.enc_left.to_le_bytes());
        out.extend_from_slice(&self.enc_right.to_le_bytes());
        out
    }
}

impl RawControllerReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONTROLLER_LEN);
        out.push(KIND_CONTROLLER);
        out.push(0);
        out.extend_from_slice(&self.stamp.to_le_bytes());
        for v in [self.desired, self.actual, self.error, self.output, self.gyro_z] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// Structural parse of a payload, no unit conversion
pub fn parse_payload(payload: &[u8]) -> Result<RawTelemetry, PayloadError> {
    let (&kind, _) = payload.split_first().ok_or(PayloadError::Empty)?;
    match kind {
        KIND_SAMPLE => {
            let flags = payload.get(1).copied().unwrap_or(0);
            let expected = if flags & FLAG_HAS_ACCEL != 0 {
                SAMPLE_WITH_ACCEL_LEN
            } else {
                SAMPLE_LEN
            };
            check_len(kind, expected, payload.len())?;

            let mut buf = &payload[2..];
            let stamp = buf.get_u32_le();
            let gyro = [buf.get_i32_le(), buf.get_i32_le(), buf.get_i32_le()];
            let accel = (flags & FLAG_HAS_ACCEL != 0)
                .then(|| [buf.get_i32_le(), buf.get_i32_le(), buf.get_i32_le()]);
            let enc_left = buf.get_i32_le();
            let enc_right = buf.get_i32_le();
            Ok(RawTelemetry::Sample(RawSample {
                stamp,
                gyro,
                accel,
                enc_left,
                enc_right,
            }))
        }
        KIND_CONTROLLER => {
            check_len(kind, CONTROLLER_LEN, payload.len())?;
            let mut buf = &payload[2..];
            Ok(RawTelemetry::Controller(RawControllerReport {
                stamp: buf.get_u32_le(),
                desired: buf.get_i32_le(),
                actual: buf.get_i32_le(),
                error: buf.get_i32_le(),
                output: buf.get_i32_le(),
                gyro_z: buf.get_i32_le(),
            }))
        }
        other => Err(PayloadError::UnknownKind(other)),
    }
}

fn check_len(kind: u8, expected: usize, actual: usize) -> Result<(), PayloadError> {
    if expected == actual {
        Ok(())
    } else {
        Err(PayloadError::Length {
            kind,
            expected,
            actual,
        })
    }
}

/// Signed difference of two readings of a wrapping counter `bits` wide
pub fn wrapping_delta(prev: u32, curr: u32, bits: u32) -> i64 {
    let modulus = 1u64 << bits;
    let diff = (curr as u64).wrapping_sub(prev as u64) & (modulus - 1);
    if diff >= modulus / 2 {
        diff as i64 - modulus as i64
    } else {
        diff as i64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    pub samples: u64,
    pub reports: u64,
    pub malformed: u64,
    pub stale: u64,
}

/// Last accepted sample position on the unwrapped source clock
#[derive(Debug, Clone, Copy)]
struct Watermark {
    raw: u32,
    ticks: u64,
    at: Instant,
}

/// Half the u32 stamp range; a forward step must be shorter than this
const STAMP_HORIZON: u32 = 1 << 31;

/// Turns verified frames into samples, enforcing strictly increasing timestamps
pub struct TelemetryDecoder {
    config: TelemetryConfig,
    last: Option<Watermark>,
    /// Set by `reset_link` until the next sample is accepted
    relinked: bool,
    /// Last accepted cumulative counts (left, right)
    baseline: Option<(u32, u32)>,
    stats: TelemetryStats,
}

impl TelemetryDecoder {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            last: None,
            relinked: false,
            baseline: None,
            stats: TelemetryStats::default(),
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        self.stats
    }

    /// Forget the encoder baseline after the link was re-established.
    ///
    /// The first sample on the new link may also restart the source clock
    /// (the controller rebooted). If its stamp is behind the watermark it is
    /// rebased past the previous sample by the wall time elapsed since then,
    /// so published stamps keep increasing.
    pub fn reset_link(&mut self) {
        self.baseline = None;
        self.relinked = true;
    }

    /// Position of `stamp` on the unwrapped clock, or None when out of order
    fn unwrap_stamp(&self, stamp: u32) -> Option<u64> {
        let Some(last) = self.last else {
            return Some(stamp as u64);
        };

        let step = stamp.wrapping_sub(last.raw);
        if (1..STAMP_HORIZON).contains(&step) {
            return Some(last.ticks + step as u64);
        }
        if self.relinked && step != 0 {
            let gap = last.at.elapsed().as_secs_f64() / self.config.timestamp_scale;
            info!(
                "Controller clock restarted ({} -> {}), rebasing timestamps",
                last.raw, stamp
            );
            return Some(last.ticks + (gap.ceil() as u64).max(1));
        }
        None
    }

    pub fn decode(&mut self, frame: &Frame) -> Option<Telemetry> {
        let raw = match parse_payload(&frame.payload) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("Dropping malformed telemetry: {}", e);
                return None;
            }
        };

        match raw {
            RawTelemetry::Sample(raw) => self.accept_sample(raw).map(Telemetry::Sample),
            RawTelemetry::Controller(raw) => {
                self.stats.reports += 1;
                Some(Telemetry::Controller(self.convert_report(raw)))
            }
        }
    }

    fn accept_sample(&mut self, raw: RawSample) -> Option<TelemetrySample> {
        let Some(ticks) = self.unwrap_stamp(raw.stamp) else {
            self.stats.stale += 1;
            trace!("Dropping out-of-order sample at {}", raw.stamp);
            return None;
        };
        self.relinked = false;
        self.last = Some(Watermark {
            raw: raw.stamp,
            ticks,
            at: Instant::now(),
        });

        let (left_ticks, right_ticks) = match self.config.encoder {
            EncoderConvention::Delta => (raw.enc_left as i64, raw.enc_right as i64),
            EncoderConvention::Cumulative { counter_bits } => {
                let counts = (raw.enc_left as u32, raw.enc_right as u32);
                let deltas = match self.baseline {
                    Some((left, right)) => (
                        wrapping_delta(left, counts.0, counter_bits),
                        wrapping_delta(right, counts.1, counter_bits),
                    ),
                    None => (0, 0),
                };
                self.baseline = Some(counts);
                deltas
            }
        };

        self.stats.samples += 1;
        let gyro_scale = self.config.gyro_scale;
        let accel_scale = self.config.accel_scale;
        Some(TelemetrySample {
            raw_stamp: raw.stamp,
            stamp: ticks as f64 * self.config.timestamp_scale,
            angular_velocity: Vector3::from(raw.gyro.map(|g| g as f64 * gyro_scale)),
            linear_acceleration: raw
                .accel
                .map(|a| Vector3::from(a.map(|v| v as f64 * accel_scale))),
            left_ticks,
            right_ticks,
        })
    }

    fn convert_report(&self, raw: RawControllerReport) -> ControllerReport {
        let velocity_scale = self.config.velocity_scale;
        ControllerReport {
            stamp: raw.stamp as f64 * self.config.timestamp_scale,
            desired_velocity: raw.desired as f64 * velocity_scale,
            actual_velocity: raw.actual as f64 * velocity_scale,
            error: raw.error as f64 * velocity_scale,
            output: raw.output as f64 * velocity_scale,
            yaw_rate: raw.gyro_z as f64 * self.config.gyro_scale,
        }
    }
}
