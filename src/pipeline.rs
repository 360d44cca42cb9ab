// Telemetry pipeline: serial bytes in, pose records out
//
//   [serial-rx thread]  transport chunks -> frame decoder -> telemetry decoder
//                              |                                   |
//                         SampleQueue                      controller reports
//                              v
//   [estimator task]    StateEstimator -> OdometryPublisher -> pose records
//
// The receive side is a plain OS thread because serial reads block; the
// estimator is a tokio task. Shutdown runs front to back: closing the
// transport ends the receive thread, which closes the queue, which ends the
// estimator task, which drops the pose channel.
//
// A link that fails for good also ends the receive thread, but the queue
// stays open: the estimator keeps predicting with growing covariance until
// `Pipeline::join`.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::estimation::{EstimatorStats, OdometryPublisher, StateEstimator};
use crate::link::{
    Connector, DecoderStats, FrameCodec, FrameDecoder, SerialTransport, Telemetry, TelemetryDecoder,
    TelemetrySample, TelemetryStats, TransportError,
};
use crate::messages::{ControllerReport, PipelineCounters, PoseRecord};
use crate::queue::SampleQueue;

const REPORT_CHANNEL: usize = 32;

/// Counters shared between the pipeline stages and the runtime
pub struct PipelineMetrics {
    frames: AtomicU64,
    checksum_errors: AtomicU64,
    malformed_payloads: AtomicU64,
    stale_samples: AtomicU64,
    queue_overflows: AtomicU64,
    estimates: AtomicU64,
    gated_measurements: AtomicU64,
    divergence_resets: AtomicU64,
    coasts: AtomicU64,
    /// f64 bits
    covariance_trace: AtomicU64,
    telemetry_stale: AtomicBool,
    degraded: AtomicBool,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            malformed_payloads: AtomicU64::new(0),
            stale_samples: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
            estimates: AtomicU64::new(0),
            gated_measurements: AtomicU64::new(0),
            divergence_resets: AtomicU64::new(0),
            coasts: AtomicU64::new(0),
            covariance_trace: AtomicU64::new(0f64.to_bits()),
            // nothing received yet
            telemetry_stale: AtomicBool::new(true),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            frames: self.frames.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            malformed_payloads: self.malformed_payloads.load(Ordering::Relaxed),
            stale_samples: self.stale_samples.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            estimates: self.estimates.load(Ordering::Relaxed),
            gated_measurements: self.gated_measurements.load(Ordering::Relaxed),
            divergence_resets: self.divergence_resets.load(Ordering::Relaxed),
            coasts: self.coasts.load(Ordering::Relaxed),
            covariance_trace: f64::from_bits(self.covariance_trace.load(Ordering::Relaxed)),
        }
    }

    pub fn telemetry_stale(&self) -> bool {
        self.telemetry_stale.load(Ordering::Acquire)
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn record_receive(&self, frames: DecoderStats, telemetry: TelemetryStats, overflows: u64) {
        self.frames.store(frames.frames, Ordering::Relaxed);
        self.checksum_errors.store(frames.checksum_errors, Ordering::Relaxed);
        self.malformed_payloads.store(telemetry.malformed, Ordering::Relaxed);
        self.stale_samples.store(telemetry.stale, Ordering::Relaxed);
        self.queue_overflows.store(overflows, Ordering::Relaxed);
    }

    fn record_estimator(&self, estimator: &StateEstimator, degraded: bool) {
        let stats: EstimatorStats = estimator.stats();
        self.estimates.store(stats.updates, Ordering::Relaxed);
        self.gated_measurements.store(stats.gated, Ordering::Relaxed);
        self.divergence_resets.store(stats.resets, Ordering::Relaxed);
        self.coasts.store(stats.coasts, Ordering::Relaxed);
        self.covariance_trace
            .store(estimator.state().trace().to_bits(), Ordering::Relaxed);
        self.degraded.store(degraded, Ordering::Release);
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving ends handed to the runtime
pub struct PipelineOutputs {
    pub poses: mpsc::Receiver<PoseRecord>,
    pub reports: mpsc::Receiver<ControllerReport>,
}

/// Handles to the running receive thread and estimator task
pub struct Pipeline {
    rx_thread: Option<JoinHandle<()>>,
    estimator: tokio::task::JoinHandle<()>,
    queue: Arc<SampleQueue<TelemetrySample>>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// Start both stages. Must be called from within a tokio runtime.
    pub fn spawn<C>(
        transport: Arc<SerialTransport<C>>,
        config: &Config,
    ) -> io::Result<(Self, PipelineOutputs)>
    where
        C: Connector + 'static,
    {
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(SampleQueue::new(config.telemetry.queue_capacity));
        let (pose_tx, pose_rx) = mpsc::channel(config.telemetry.queue_capacity.max(1));
        let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL);

        let receiver = Receiver {
            frames: FrameCodec::new(config.framing.clone()).decoder(),
            telemetry: TelemetryDecoder::new(config.telemetry.clone()),
            queue: queue.clone(),
            reports: report_tx,
            metrics: metrics.clone(),
        };
        let rx_thread = std::thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || receiver.run(&transport))?;

        let estimator = tokio::spawn(estimator_loop(
            queue.clone(),
            StateEstimator::new(config.estimator.clone()),
            pose_tx,
            metrics.clone(),
            config.telemetry.stale_after(),
        ));

        let pipeline = Self {
            rx_thread: Some(rx_thread),
            estimator,
            queue,
            metrics,
        };
        let outputs = PipelineOutputs {
            poses: pose_rx,
            reports: report_rx,
        };
        Ok((pipeline, outputs))
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Wait for both stages to finish; close the transport first
    pub async fn join(mut self) {
        if let Some(handle) = self.rx_thread.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("Receive thread panicked"),
                Err(e) => error!("Failed to join receive thread: {}", e),
            }
        }
        // still open when the link failed for good
        self.queue.close();
        if let Err(e) = self.estimator.await {
            error!("Estimator task failed: {}", e);
        }
        debug!("Pipeline stopped");
    }
}

/// State owned by the receive thread
struct Receiver {
    frames: FrameDecoder,
    telemetry: TelemetryDecoder,
    queue: Arc<SampleQueue<TelemetrySample>>,
    reports: mpsc::Sender<ControllerReport>,
    metrics: Arc<PipelineMetrics>,
}

impl Receiver {
    fn run<C: Connector>(mut self, transport: &SerialTransport<C>) {
        info!("Receive thread started");

        for chunk in transport.chunks() {
            match chunk {
                Ok(bytes) if bytes.is_empty() => continue,
                Ok(bytes) => self.on_bytes(&bytes),
                Err(e) if e.is_recoverable() => {
                    // partial frames and encoder baselines don't survive a reconnect
                    debug!("Resetting decoders: {}", e);
                    self.frames.clear();
                    self.telemetry.reset_link();
                }
                Err(TransportError::ConnectFailed { link, attempts, .. }) => {
                    error!("Link {} unrecoverable after {} attempts", link, attempts);
                }
                Err(e) => {
                    error!("Receive loop stopped: {}", e);
                }
            }
        }

        if transport.is_closed() {
            self.queue.close();
        } else {
            warn!("Receive thread finished without telemetry, estimator keeps predicting");
        }
        info!("Receive thread finished");
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.frames.extend(bytes);
        while let Some(frame) = self.frames.next_frame() {
            match self.telemetry.decode(&frame) {
                Some(Telemetry::Sample(sample)) => {
                    self.queue.push(sample);
                }
                Some(Telemetry::Controller(report)) => {
                    if self.reports.try_send(report).is_err() {
                        trace!("Controller report dropped");
                    }
                }
                None => {}
            }
        }
        self.metrics.record_receive(
            self.frames.stats(),
            self.telemetry.stats(),
            self.queue.overflows(),
        );
    }
}

async fn estimator_loop(
    queue: Arc<SampleQueue<TelemetrySample>>,
    mut estimator: StateEstimator,
    poses: mpsc::Sender<PoseRecord>,
    metrics: Arc<PipelineMetrics>,
    stale_after: Duration,
) {
    let mut publisher = OdometryPublisher::new();

    loop {
        match tokio::time::timeout(stale_after, queue.pop()).await {
            Ok(Some(sample)) => {
                if metrics.telemetry_stale.swap(false, Ordering::AcqRel) {
                    info!("Receiving telemetry");
                }
                let estimate = estimator.update(&sample);
                metrics.record_estimator(&estimator, estimate.degraded);

                if let Some(record) = publisher.on_estimate(&estimate) {
                    if poses.send(record).await.is_err() {
                        debug!("Pose receiver dropped");
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                if !metrics.telemetry_stale.swap(true, Ordering::AcqRel) {
                    warn!("No telemetry for {:?}, coasting", stale_after);
                }
                estimator.predict(stale_after.as_secs_f64());
                metrics.record_estimator(&estimator, estimator.is_degraded());
            }
        }
    }

    debug!(
        "Estimator task finished after {} updates ({} published)",
        estimator.stats().updates,
        publisher.emitted()
    );
}
