// Serial link to the differential-drive motor controller
//
// Provides:
// - Serial transport with bounded reconnection and a watched link status
// - Delimited, length-prefixed, checksummed frame codec
// - Rate-limited velocity command encoder
// - Telemetry decoder (sensor samples, controller reports)

pub mod codec;
pub mod command;
pub mod telemetry;
pub mod transport;

pub use codec::{CodecError, DecoderStats, Direction, Frame, FrameCodec, FrameDecoder};
pub use command::{ClampReport, CommandEncoder, CommandError, CommandStats, Dispatch, FrameSink, SubmitOutcome};
pub use telemetry::{Telemetry, TelemetryDecoder, TelemetrySample, TelemetryStats};
pub use transport::{
    Connector, LinkReader, LinkStatus, LinkWriter, SerialConnector, SerialTransport, TransportError,
    TransportStats,
};
