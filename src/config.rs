// Runtime configuration: serial link, wire framing, command limits, telemetry
// layout, estimator tuning and zenoh topics.
//
// Every field has a default so an empty TOML file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;
pub const MAX_LOOP_HZ: u64 = 1000;

// Slowest accepted command rate (one frame every 10 s)
pub const MIN_COMMAND_RATE_HZ: f64 = 0.1;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_VEL: &str = "diffbot/cmd/vel"; // velocity commands
pub const TOPIC_ODOM: &str = "diffbot/state/odom"; // pose estimates
pub const TOPIC_HEALTH: &str = "diffbot/state/health"; // health status
pub const TOPIC_CONTROLLER: &str = "diffbot/state/controller"; // firmware diagnostics

// Serial port of the motor controller (Raspberry Pi UART)
pub const SERIAL_PORT: &str = "/dev/ttyAMA0";
pub const SERIAL_BAUDRATE: u32 = 115_200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub serial: SerialConfig,
    pub framing: FramingConfig,
    pub command: CommandConfig,
    pub telemetry: TelemetryConfig,
    pub estimator: EstimatorConfig,
    pub zenoh: ZenohConfig,
}

impl Config {
    /// Load a configuration from a TOML file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break an invariant of some component
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")))
            }
        }

        fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must not be negative, got {value}")))
            }
        }

        let serial = &self.serial;
        if serial.path.is_empty() {
            return Err(ConfigError::Invalid("serial.path is empty".into()));
        }
        if serial.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("serial.read_timeout_ms must be > 0".into()));
        }
        let reconnect = &serial.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid("serial.reconnect.max_attempts must be > 0".into()));
        }
        if reconnect.initial_backoff_ms > reconnect.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "serial.reconnect.initial_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }

        let framing = &self.framing;
        if framing.delimiter.is_empty() {
            return Err(ConfigError::Invalid("framing.delimiter is empty".into()));
        }
        if framing.max_payload == 0 || framing.max_payload > framing.length.max_value() {
            return Err(ConfigError::Invalid(format!(
                "framing.max_payload must be in 1..={} for a {:?} length field",
                framing.length.max_value(),
                framing.length
            )));
        }
        if framing.max_buffer < 2 * framing.max_frame_len() {
            return Err(ConfigError::Invalid(format!(
                "framing.max_buffer must hold at least two frames ({} bytes)",
                2 * framing.max_frame_len()
            )));
        }

        let command = &self.command;
        positive("command.max_linear", command.max_linear)?;
        positive("command.max_angular", command.max_angular)?;
        positive("command.rate_hz", command.rate_hz)?;
        if command.rate_hz < MIN_COMMAND_RATE_HZ {
            return Err(ConfigError::Invalid(format!(
                "command.rate_hz must be at least {MIN_COMMAND_RATE_HZ}, got {}",
                command.rate_hz
            )));
        }
        positive("command.linear_scale", command.linear_scale)?;
        positive("command.angular_scale", command.angular_scale)?;

        let telemetry = &self.telemetry;
        positive("telemetry.timestamp_scale", telemetry.timestamp_scale)?;
        positive("telemetry.gyro_scale", telemetry.gyro_scale)?;
        positive("telemetry.accel_scale", telemetry.accel_scale)?;
        positive("telemetry.velocity_scale", telemetry.velocity_scale)?;
        if let EncoderConvention::Cumulative { counter_bits } = telemetry.encoder {
            if !(2..=32).contains(&counter_bits) {
                return Err(ConfigError::Invalid(format!(
                    "telemetry.encoder.counter_bits must be in 2..=32, got {counter_bits}"
                )));
            }
        }
        if telemetry.queue_capacity == 0 {
            return Err(ConfigError::Invalid("telemetry.queue_capacity must be > 0".into()));
        }
        if telemetry.stale_after_ms == 0 {
            return Err(ConfigError::Invalid("telemetry.stale_after_ms must be > 0".into()));
        }

        let est = &self.estimator;
        positive("estimator.wheel_base", est.wheel_base)?;
        positive("estimator.distance_per_tick", est.distance_per_tick)?;
        positive("estimator.initial_variance", est.initial_variance)?;
        non_negative("estimator.process_noise.position", est.process_noise.position)?;
        non_negative("estimator.process_noise.heading", est.process_noise.heading)?;
        non_negative("estimator.process_noise.linear", est.process_noise.linear)?;
        non_negative("estimator.process_noise.angular", est.process_noise.angular)?;
        non_negative("estimator.wheel_noise", est.wheel_noise)?;
        positive("estimator.wheel_noise_floor", est.wheel_noise_floor)?;
        positive("estimator.gyro_variance", est.gyro_variance)?;
        positive("estimator.gate_sigma", est.gate_sigma)?;
        positive("estimator.max_dt", est.max_dt)?;
        // reset must land below the ceiling or it would re-trigger immediately
        if est.covariance_ceiling <= 5.0 * est.initial_variance {
            return Err(ConfigError::Invalid(format!(
                "estimator.covariance_ceiling ({}) must exceed the initial covariance trace ({})",
                est.covariance_ceiling,
                5.0 * est.initial_variance
            )));
        }

        if !(1..=MAX_LOOP_HZ).contains(&self.zenoh.loop_hz) {
            return Err(ConfigError::Invalid(format!(
                "zenoh.loop_hz must be in 1..={MAX_LOOP_HZ}, got {}",
                self.zenoh.loop_hz
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: SERIAL_PORT.to_string(),
            baud_rate: SERIAL_BAUDRATE,
            read_timeout_ms: 50,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Bounded exponential backoff for (re)connecting the link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ReconnectConfig {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Width of the payload length field on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthField {
    U8,
    U16,
}

impl LengthField {
    pub fn width(self) -> usize {
        match self {
            LengthField::U8 => 1,
            LengthField::U16 => 2,
        }
    }

    pub fn max_value(self) -> usize {
        match self {
            LengthField::U8 => u8::MAX as usize,
            LengthField::U16 => u16::MAX as usize,
        }
    }
}

/// Integrity check appended to every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumKind {
    /// Sum of bytes modulo 256
    Additive8,
    /// XOR of all bytes
    Xor8,
    /// CRC-16/CCITT-FALSE, little-endian on the wire
    Crc16CcittFalse,
}

impl ChecksumKind {
    pub fn width(self) -> usize {
        match self {
            ChecksumKind::Additive8 | ChecksumKind::Xor8 => 1,
            ChecksumKind::Crc16CcittFalse => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FramingConfig {
    pub delimiter: Vec<u8>,
    pub length: LengthField,
    pub checksum: ChecksumKind,
    pub max_payload: usize,
    pub max_buffer: usize,
}

impl FramingConfig {
    pub fn header_len(&self) -> usize {
        self.delimiter.len() + self.length.width()
    }

    pub fn max_frame_len(&self) -> usize {
        self.header_len() + self.max_payload + self.checksum.width()
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiter: vec![0xAA, 0x55],
            length: LengthField::U8,
            checksum: ChecksumKind::Crc16CcittFalse,
            max_payload: 64,
            max_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    /// m/s
    pub max_linear: f64,
    /// rad/s
    pub max_angular: f64,
    /// Maximum frequency of velocity frames sent to the controller
    pub rate_hz: f64,
    /// SI -> wire units (m/s -> cm/s)
    pub linear_scale: f64,
    /// SI -> wire units (rad/s -> mrad/s)
    pub angular_scale: f64,
    /// Watchdog: stop the robot when no command arrives within this window
    pub timeout_ms: u64,
    /// Default for commands that don't say whether the firmware speed loop is used
    pub use_controller: bool,
}

impl CommandConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_linear: 0.5,
            max_angular: 1.5,
            rate_hz: 20.0,
            linear_scale: 100.0,
            angular_scale: 1000.0,
            timeout_ms: CMD_TIMEOUT.as_millis() as u64,
            use_controller: true,
        }
    }
}

/// How the firmware reports wheel encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EncoderConvention {
    /// Ticks since the previous sample
    Delta,
    /// Free-running counter of the given width that wraps around
    Cumulative { counter_bits: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Source timestamp ticks -> seconds
    pub timestamp_scale: f64,
    /// Raw gyro -> rad/s (firmware reports micro-degrees per second)
    pub gyro_scale: f64,
    /// Raw accelerometer -> m/s^2
    pub accel_scale: f64,
    /// Raw controller-report velocities -> m/s
    pub velocity_scale: f64,
    pub encoder: EncoderConvention,
    pub queue_capacity: usize,
    /// Without samples for this long the estimator coasts and telemetry is reported stale
    pub stale_after_ms: u64,
}

impl TelemetryConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            timestamp_scale: 1e-3,
            gyro_scale: 1e-6 * std::f64::consts::PI / 180.0,
            accel_scale: 1e-3,
            velocity_scale: 1e-3,
            encoder: EncoderConvention::Cumulative { counter_bits: 32 },
            queue_capacity: 64,
            stale_after_ms: 200,
        }
    }
}

/// Continuous-time process noise densities (variance per second)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessNoise {
    pub position: f64,
    pub heading: f64,
    pub linear: f64,
    pub angular: f64,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        Self {
            position: 1e-4,
            heading: 1e-4,
            linear: 0.05,
            angular: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Distance between the wheels (m)
    pub wheel_base: f64,
    /// Encoder-to-distance scale (m per tick)
    pub distance_per_tick: f64,
    /// Diagonal of the covariance at startup and after a reset
    pub initial_variance: f64,
    pub process_noise: ProcessNoise,
    /// Wheel travel variance per metre travelled
    pub wheel_noise: f64,
    /// Minimum wheel travel variance per sample (m^2)
    pub wheel_noise_floor: f64,
    /// Gyro measurement variance ((rad/s)^2)
    pub gyro_variance: f64,
    /// Innovations beyond this many standard deviations are rejected
    pub gate_sigma: f64,
    /// Covariance trace beyond which the filter is considered diverged
    pub covariance_ceiling: f64,
    /// Samples of encoder-only dead reckoning after a divergence reset
    pub recovery_samples: u32,
    /// Upper bound on a single prediction step (s)
    pub max_dt: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            wheel_base: 0.30,
            distance_per_tick: 1e-3,
            initial_variance: 1.0,
            process_noise: ProcessNoise::default(),
            wheel_noise: 1e-3,
            wheel_noise_floor: 1e-6,
            gyro_variance: 0.01,
            gate_sigma: 3.0,
            covariance_ceiling: 1e3,
            recovery_samples: 50,
            max_dt: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZenohConfig {
    pub cmd_topic: String,
    pub odom_topic: String,
    pub health_topic: String,
    pub diagnostics_topic: String,
    pub loop_hz: u64,
}

impl ZenohConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.loop_hz.clamp(1, MAX_LOOP_HZ))
    }
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            cmd_topic: TOPIC_CMD_VEL.to_string(),
            odom_topic: TOPIC_ODOM.to_string(),
            health_topic: TOPIC_HEALTH.to_string(),
            diagnostics_topic: TOPIC_CONTROLLER.to_string(),
            loop_hz: LOOP_HZ,
        }
    }
}
