// Bridge runtime: zenoh <-> serial motor controller
//
// Tick loop at `loop_hz`:
// 1. drain velocity commands from zenoh, feed the command encoder
// 2. watchdog: stop the base when commands go stale
// 3. flush a coalesced command once the rate limit allows it
// 4. publish pose records, controller diagnostics and health
//
// Telemetry is received and fused off this loop (see `pipeline`), so a slow
// zenoh publish never stalls the serial link and vice versa.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::link::{
    CommandEncoder, CommandError, Connector, FrameCodec, FrameSink, LinkStatus, SerialConnector,
    SerialTransport,
};
use crate::messages::{CmdVel, HealthReport, RuntimeHealth, VelocityCommand};
use crate::pipeline::{Pipeline, PipelineMetrics, PipelineOutputs};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where serialized records go; a zenoh publisher outside of tests
trait RecordSink {
    async fn put_json(&self, json: String) -> Result<(), BoxError>;
}

impl RecordSink for zenoh::pubsub::Publisher<'_> {
    async fn put_json(&self, json: String) -> Result<(), BoxError> {
        self.put(json).await
    }
}

/// Zenoh publishers for everything the runtime emits
struct Outlets<P> {
    odom: P,
    diagnostics: P,
    health: P,
}

impl<P: RecordSink> Outlets<P> {
    /// Forward buffered pose records and controller reports, then the health report
    async fn publish(&self, outputs: &mut PipelineOutputs, health: &HealthReport) -> Result<(), BoxError> {
        while let Ok(record) = outputs.poses.try_recv() {
            self.odom.put_json(serde_json::to_string(&record)?).await?;
        }
        while let Ok(report) = outputs.reports.try_recv() {
            self.diagnostics.put_json(serde_json::to_string(&report)?).await?;
        }
        self.health.put_json(serde_json::to_string(health)?).await
    }
}

/// Command side of the runtime: watchdog + encoder
pub struct Runtime<S: FrameSink> {
    encoder: CommandEncoder<S>,
    cmd_timeout: Duration,
    default_use_controller: bool,
    cmd_received_at: Option<Instant>,
    /// Stop already sent for the current stale period
    stopped: bool,
    health: RuntimeHealth,
}

impl<S: FrameSink> Runtime<S> {
    pub fn new(encoder: CommandEncoder<S>, config: &Config) -> Self {
        Self {
            encoder,
            cmd_timeout: config.command.timeout(),
            default_use_controller: config.command.use_controller,
            cmd_received_at: None,
            stopped: false,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn encoder(&self) -> &CommandEncoder<S> {
        &self.encoder
    }

    /// Process incoming command
    pub fn on_command(&mut self, cmd: &CmdVel, now: Instant) {
        debug!("Received command: {:?}", cmd);
        let vel = VelocityCommand::from_cmd_vel(cmd, self.default_use_controller).issued_at(now);
        match self.encoder.submit_at(vel, now) {
            Ok(_) => {
                self.cmd_received_at = Some(now);
                self.stopped = false;
            }
            Err(e @ CommandError::NonFinite { .. }) => warn!("Rejected command: {}", e),
            Err(e) => {
                // the command still counts as fresh; the next one may get through
                self.cmd_received_at = Some(now);
                self.stopped = false;
                warn!("{}", e);
            }
        }
    }

    /// Watchdog and rate-limit flush for one tick. Returns whether commands are fresh.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        let fresh = match self.cmd_received_at {
            Some(at) => now.duration_since(at) <= self.cmd_timeout,
            None => false,
        };

        if !fresh {
            // Watchdog triggered - stop the robot
            if !self.stopped {
                if let Some(at) = self.cmd_received_at {
                    warn!("Command stale ({:?} old), stopping robot", now.duration_since(at));
                }
                match self.encoder.stop() {
                    Ok(()) => self.stopped = true,
                    Err(e) => debug!("Stop not delivered: {}", e),
                }
            }
            return false;
        }

        if let Err(e) = self.encoder.flush_due(now) {
            warn!("{}", e);
        }
        true
    }

    /// Link loss invalidates whatever the controller was last told
    pub fn on_link_change(&mut self, status: LinkStatus) {
        if status.is_connected() {
            self.stopped = false;
        }
    }

    /// Zero velocity on the way out
    pub fn shutdown(&mut self) {
        if let Err(e) = self.encoder.stop() {
            warn!("Failed to stop base on shutdown: {}", e);
        }
    }

    /// Worst condition wins
    pub fn evaluate(&mut self, link: LinkStatus, fresh: bool, metrics: &PipelineMetrics) -> RuntimeHealth {
        self.health = if !link.is_connected() {
            RuntimeHealth::LinkDown
        } else if metrics.telemetry_stale() {
            RuntimeHealth::TelemetryStale
        } else if metrics.degraded() {
            RuntimeHealth::Degraded
        } else if !fresh {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        };
        self.health
    }
}

/// Run against the configured serial port
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let connector = SerialConnector::new(&config.serial);
    run_with(connector, config).await
}

pub async fn run_with<C>(connector: C, config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    C: Connector + 'static,
{
    info!("Opening serial link {}...", connector.describe());
    let transport = Arc::new(SerialTransport::new(connector, config.serial.clone()));
    {
        let transport = transport.clone();
        tokio::task::spawn_blocking(move || transport.connect()).await??;
    }
    let mut link_status = transport.subscribe();
    let mut last_link = *link_status.borrow_and_update();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    let topics = &config.zenoh;
    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(topics.cmd_topic.as_str()).await?;
    let outlets = Outlets {
        odom: session.declare_publisher(topics.odom_topic.as_str()).await?,
        diagnostics: session
            .declare_publisher(topics.diagnostics_topic.as_str())
            .await?,
        health: session.declare_publisher(topics.health_topic.as_str()).await?,
    };

    let (pipeline, mut outputs) = Pipeline::spawn(transport.clone(), &config)?;
    let metrics = pipeline.metrics().clone();

    let encoder = CommandEncoder::new(
        transport.clone(),
        FrameCodec::new(config.framing.clone()),
        config.command.clone(),
    );
    let mut runtime = Runtime::new(encoder, &config);
    let mut tick = interval(topics.tick_period());

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout, {}Hz command rate",
        topics.loop_hz,
        config.command.timeout_ms,
        config.command.rate_hz
    );
    info!("Subscribed to: {}", topics.cmd_topic);
    info!(
        "Publishing to: {}, {}, {}",
        topics.odom_topic, topics.health_topic, topics.diagnostics_topic
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result: Result<(), BoxError> = loop {
        tokio::select! {
            _ = tick.tick() => {}
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                info!("Shutting down...");
                break Ok(());
            }
        }
        let now = Instant::now();

        // 1. Drain all pending commands (non-blocking), keep feeding the encoder
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<CmdVel>(&payload) {
                Ok(cmd) => runtime.on_command(&cmd, now),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Link transitions
        let link = *link_status.borrow_and_update();
        if link != last_link {
            info!("Link status: {:?}", link);
            runtime.on_link_change(link);
            last_link = link;
        }

        // 3. Watchdog + coalesced command flush
        let fresh = runtime.on_tick(now);

        // 4. Publish pose records, diagnostics and health
        let report = HealthReport {
            health: runtime.evaluate(link, fresh, &metrics),
            link,
            transport: transport.stats(),
            pipeline: metrics.snapshot(),
        };
        if let Err(e) = outlets.publish(&mut outputs, &report).await {
            error!("Failed to publish: {}", e);
            break Err(e);
        }

        if link.is_fatal() {
            error!("Serial link is gone for good, exiting");
            break Err("serial link failed permanently".into());
        }
    };

    runtime.shutdown();
    transport.close();
    pipeline.join().await;
    info!("Runtime stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::TransportError;
    use crate::link::command::VELOCITY_PAYLOAD_LEN;
    use crate::messages::PoseRecord;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    impl RecordingSink {
        /// Decoded (linear, angular) wire values of every frame sent
        fn velocities(&self) -> Vec<(i16, i16)> {
            let header = crate::config::FramingConfig::default().header_len();
            self.frames
                .lock()
                .iter()
                .map(|f| {
                    let p = &f[header..header + VELOCITY_PAYLOAD_LEN];
                    (i16::from_le_bytes([p[2], p[3]]), i16::from_le_bytes([p[4], p[5]]))
                })
                .collect()
        }
    }

    fn runtime(sink: Arc<RecordingSink>) -> Runtime<Arc<RecordingSink>> {
        let config = Config::default();
        let encoder = CommandEncoder::new(
            sink,
            FrameCodec::new(config.framing.clone()),
            config.command.clone(),
        );
        Runtime::new(encoder, &config)
    }

    #[derive(Default)]
    struct MemorySink {
        published: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordSink for MemorySink {
        async fn put_json(&self, json: String) -> Result<(), BoxError> {
            if self.fail {
                return Err("publisher closed".into());
            }
            self.published.lock().push(json);
            Ok(())
        }
    }

    fn health_report() -> HealthReport {
        HealthReport {
            health: RuntimeHealth::Ok,
            link: LinkStatus::Connected,
            transport: Default::default(),
            pipeline: PipelineMetrics::new().snapshot(),
        }
    }

    fn pose(stamp: f64) -> PoseRecord {
        PoseRecord {
            stamp,
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            linear: 0.0,
            angular: 0.0,
            pose_covariance: [0.0; 9],
            twist_covariance: [0.0; 4],
            degraded: false,
        }
    }

    fn cmd(linear: f64, angular: f64) -> CmdVel {
        CmdVel {
            linear,
            angular,
            use_controller: None,
        }
    }

    #[test]
    fn test_starts_stale_and_stops_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut rt = runtime(sink.clone());
        let t0 = Instant::now();

        assert!(!rt.on_tick(t0));
        assert!(!rt.on_tick(t0 + Duration::from_millis(20)));
        assert_eq!(sink.velocities(), vec![(0, 0)]);
        assert_eq!(rt.health(), RuntimeHealth::CmdStale);
    }

    #[test]
    fn test_watchdog_stops_after_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let mut rt = runtime(sink.clone());
        let t0 = Instant::now();

        rt.on_command(&cmd(0.2, 0.5), t0);
        assert!(rt.on_tick(t0 + Duration::from_millis(20)));
        assert!(rt.on_tick(t0 + Duration::from_millis(240)));
        assert!(!rt.on_tick(t0 + Duration::from_millis(300)));
        assert!(!rt.on_tick(t0 + Duration::from_millis(320)));

        assert_eq!(sink.velocities(), vec![(20, 500), (0, 0)]);
    }

    #[test]
    fn test_coalesced_command_flushed_on_tick() {
        let sink = Arc::new(RecordingSink::default());
        let mut rt = runtime(sink.clone());
        let t0 = Instant::now();

        rt.on_command(&cmd(0.1, 0.0), t0);
        rt.on_command(&cmd(0.2, 0.0), t0 + Duration::from_millis(10));
        rt.on_command(&cmd(0.3, 0.0), t0 + Duration::from_millis(20));
        assert_eq!(sink.velocities().len(), 1);

        // 20 Hz -> 50 ms between frames
        rt.on_tick(t0 + Duration::from_millis(40));
        assert_eq!(sink.velocities().len(), 1);
        rt.on_tick(t0 + Duration::from_millis(60));
        assert_eq!(sink.velocities(), vec![(10, 0), (30, 0)]);
    }

    #[test]
    fn test_non_finite_command_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let mut rt = runtime(sink.clone());
        let t0 = Instant::now();

        rt.on_command(&cmd(f64::NAN, 0.0), t0);
        assert!(sink.velocities().is_empty());
        // never refreshed the watchdog
        assert!(!rt.on_tick(t0));
    }

    #[test]
    fn test_health_priority() {
        let sink = Arc::new(RecordingSink::default());
        let mut rt = runtime(sink);
        let metrics = PipelineMetrics::new();

        assert_eq!(
            rt.evaluate(LinkStatus::Reconnecting, true, &metrics),
            RuntimeHealth::LinkDown
        );
        assert_eq!(
            rt.evaluate(LinkStatus::Connected, true, &metrics),
            RuntimeHealth::TelemetryStale
        );
    }

    #[tokio::test]
    async fn test_publish_forwards_everything() {
        let (pose_tx, poses) = mpsc::channel(4);
        let (_report_tx, reports) = mpsc::channel(4);
        let mut outputs = PipelineOutputs { poses, reports };
        pose_tx.send(pose(1.0)).await.unwrap();
        pose_tx.send(pose(1.1)).await.unwrap();

        let outlets = Outlets {
            odom: MemorySink::default(),
            diagnostics: MemorySink::default(),
            health: MemorySink::default(),
        };
        outlets.publish(&mut outputs, &health_report()).await.unwrap();

        assert_eq!(outlets.odom.published.lock().len(), 2);
        assert!(outlets.diagnostics.published.lock().is_empty());
        let health = outlets.health.published.lock();
        assert_eq!(health.len(), 1);
        assert!(health[0].contains(r#""health":"ok""#));
    }

    #[tokio::test]
    async fn test_publish_error_is_returned() {
        let (pose_tx, poses) = mpsc::channel(4);
        let (_report_tx, reports) = mpsc::channel(4);
        let mut outputs = PipelineOutputs { poses, reports };
        pose_tx.send(pose(1.0)).await.unwrap();

        let outlets = Outlets {
            odom: MemorySink {
                fail: true,
                ..MemorySink::default()
            },
            diagnostics: MemorySink::default(),
            health: MemorySink::default(),
        };
        let err = outlets.publish(&mut outputs, &health_report()).await.unwrap_err();
        assert_eq!(err.to_string(), "publisher closed");
        // nothing after the failed put
        assert!(outlets.health.published.lock().is_empty());
    }
}
