// Velocity command encoder
//
// Clamps requests to the hardware limits, coalesces bursts down to the
// configured frame rate and writes binary velocity frames to the link.
//
// Payload: [Kind=0x01, Flags, Linear(i16 LE), Angular(i16 LE)]
// Flags bit 0: use the firmware speed controller.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::codec::{CodecError, FrameCodec};
use super::transport::{Connector, SerialTransport, TransportError};
use crate::config::CommandConfig;
use crate::messages::VelocityCommand;

pub const KIND_VELOCITY: u8 = 0x01;
pub const FLAG_USE_CONTROLLER: u8 = 0x01;
pub const VELOCITY_PAYLOAD_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Velocity command is not finite: linear={linear}, angular={angular}")]
    NonFinite { linear: f64, angular: f64 },

    #[error("Failed to encode command frame: {0}")]
    Codec(#[from] CodecError),

    #[error("Failed to send command: {0}")]
    Transport(#[from] TransportError),
}

/// Anything that accepts complete outbound frames
pub trait FrameSink {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;
}

impl<C: Connector> FrameSink for SerialTransport<C> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.send(frame)
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).send_frame(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Written to the link now
    Sent,
    /// Held back by the rate limit; replaces any earlier pending command
    Coalesced,
}

/// Requested vs applied velocities when a clamp kicked in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClampReport {
    pub requested_linear: f64,
    pub requested_angular: f64,
    pub applied_linear: f64,
    pub applied_angular: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubmitOutcome {
    pub dispatch: Dispatch,
    pub clamp: Option<ClampReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub sent: u64,
    pub coalesced: u64,
    pub clamped: u64,
    pub failed: u64,
}

pub struct CommandEncoder<S> {
    sink: S,
    codec: FrameCodec,
    config: CommandConfig,
    last_sent: Option<Instant>,
    pending: Option<VelocityCommand>,
    stats: CommandStats,
}

impl<S: FrameSink> CommandEncoder<S> {
    pub fn new(sink: S, codec: FrameCodec, config: CommandConfig) -> Self {
        Self {
            sink,
            codec,
            config,
            last_sent: None,
            pending: None,
            stats: CommandStats::default(),
        }
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    pub fn pending(&self) -> Option<&VelocityCommand> {
        self.pending.as_ref()
    }

    pub fn submit(&mut self, cmd: VelocityCommand) -> Result<SubmitOutcome, CommandError> {
        self.submit_at(cmd, Instant::now())
    }

    /// Submit with an explicit clock reading
    pub fn submit_at(
        &mut self,
        cmd: VelocityCommand,
        now: Instant,
    ) -> Result<SubmitOutcome, CommandError> {
        if !cmd.linear.is_finite() || !cmd.angular.is_finite() {
            return Err(CommandError::NonFinite {
                linear: cmd.linear,
                angular: cmd.angular,
            });
        }

        let (cmd, clamp) = self.clamp(cmd);
        if let Some(report) = &clamp {
            self.stats.clamped += 1;
            warn!(
                "Velocity clamped: linear {:.3} -> {:.3} m/s, angular {:.3} -> {:.3} rad/s",
                report.requested_linear,
                report.applied_linear,
                report.requested_angular,
                report.applied_angular
            );
        }

        if !self.is_due(now) {
            if self.pending.replace(cmd).is_some() {
                self.stats.coalesced += 1;
            }
            return Ok(SubmitOutcome {
                dispatch: Dispatch::Coalesced,
                clamp,
            });
        }

        // a fresh command supersedes whatever was waiting
        if self.pending.take().is_some() {
            self.stats.coalesced += 1;
        }
        self.transmit(&cmd, now)?;
        Ok(SubmitOutcome {
            dispatch: Dispatch::Sent,
            clamp,
        })
    }

    /// Send the coalesced command once the rate limit allows it.
    /// Returns whether a frame was written.
    pub fn flush_due(&mut self, now: Instant) -> Result<bool, CommandError> {
        if self.pending.is_none() || !self.is_due(now) {
            return Ok(false);
        }
        let Some(cmd) = self.pending.take() else {
            return Ok(false);
        };
        self.transmit(&cmd, now)?;
        Ok(true)
    }

    /// Zero velocity right away, ignoring the rate limit
    pub fn stop(&mut self) -> Result<(), CommandError> {
        self.pending = None;
        let now = Instant::now();
        self.transmit(&VelocityCommand::stop().issued_at(now), now)
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) => now.duration_since(last) >= self.config.min_interval(),
            None => true,
        }
    }

    fn clamp(&self, cmd: VelocityCommand) -> (VelocityCommand, Option<ClampReport>) {
        let linear = cmd.linear.clamp(-self.config.max_linear, self.config.max_linear);
        let angular = cmd.angular.clamp(-self.config.max_angular, self.config.max_angular);
        if linear == cmd.linear && angular == cmd.angular {
            return (cmd, None);
        }
        let report = ClampReport {
            requested_linear: cmd.linear,
            requested_angular: cmd.angular,
            applied_linear: linear,
            applied_angular: angular,
        };
        (
            VelocityCommand {
                linear,
                angular,
                ..cmd
            },
            Some(report),
        )
    }

    fn transmit(&mut self, cmd: &VelocityCommand, now: Instant) -> Result<(), CommandError> {
        let payload = encode_velocity(cmd, &self.config);
        let frame = self.codec.encode(&payload)?;
        self.last_sent = Some(now);

        debug!(
            "Sending velocity: linear={:.3} m/s, angular={:.3} rad/s, controller={}",
            cmd.linear, cmd.angular, cmd.use_controller
        );
        match self.sink.send_frame(frame.wire()) {
            Ok(()) => {
                self.stats.sent += 1;
                Ok(())
            }
            Err(e) => {
                self.stats.failed += 1;
                Err(e.into())
            }
        }
    }
}

/// Serialize a command into wire units
pub fn encode_velocity(cmd: &VelocityCommand, config: &CommandConfig) -> [u8; VELOCITY_PAYLOAD_LEN] {
    let linear = to_wire(cmd.linear * config.linear_scale).to_le_bytes();
    let angular = to_wire(cmd.angular * config.angular_scale).to_le_bytes();
    let flags = if cmd.use_controller { FLAG_USE_CONTROLLER } else { 0 };
    [KIND_VELOCITY, flags, linear[0], linear[1], angular[0], angular[1]]
}

fn to_wire(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}
