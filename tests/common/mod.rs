// Scripted in-memory serial link for end-to-end tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use diffbot_zenoh_runtime::config::{Config, ReconnectConfig};
use diffbot_zenoh_runtime::link::telemetry::RawSample;
use diffbot_zenoh_runtime::link::{Connector, FrameCodec, LinkReader, LinkWriter};

/// How long an idle read blocks before reporting a timeout
const IDLE_READ: Duration = Duration::from_millis(2);

pub enum Step {
    Data(Vec<u8>),
    Fail,
}

#[derive(Default)]
pub struct Script {
    pub reads: VecDeque<Step>,
    pub written: Vec<u8>,
    pub connects: u32,
    /// Refuse every connect while set
    pub refuse: bool,
}

/// Connector whose reads and connect outcomes are driven by the test
#[derive(Clone, Default)]
pub struct ScriptedConnector(pub Arc<Mutex<Script>>);

impl ScriptedConnector {
    pub fn push(&self, bytes: impl Into<Vec<u8>>) {
        self.0.lock().reads.push_back(Step::Data(bytes.into()));
    }

    pub fn unplug(&self) {
        self.0.lock().reads.push_back(Step::Fail);
    }

    pub fn refuse(&self, refuse: bool) {
        self.0.lock().refuse = refuse;
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.lock().written.clone()
    }

    pub fn connects(&self) -> u32 {
        self.0.lock().connects
    }
}

struct ScriptedReader(Arc<Mutex<Script>>);
struct ScriptedWriter(Arc<Mutex<Script>>);

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let step = self.0.lock().reads.pop_front();
        match step {
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    self.0.lock().reads.push_front(Step::Data(rest));
                }
                Ok(n)
            }
            Some(Step::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            None => {
                std::thread::sleep(IDLE_READ);
                Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"))
            }
        }
    }
}

impl Write for ScriptedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> io::Result<(LinkReader, LinkWriter)> {
        let mut script = self.0.lock();
        script.connects += 1;
        if script.refuse {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        Ok((
            Box::new(ScriptedReader(self.0.clone())),
            Box::new(ScriptedWriter(self.0.clone())),
        ))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Defaults with fast reconnects
pub fn config(max_attempts: u32) -> Config {
    let mut config = Config::default();
    config.serial.reconnect = ReconnectConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    config
}

/// 0.1 rad/s in the firmware's micro-degrees per second
pub const YAW_0_1: i32 = 5_729_578;

/// Wire bytes of one sensor sample
pub fn sample_frame(config: &Config, stamp_ms: u32, gyro_z: i32, left: i32, right: i32) -> Vec<u8> {
    let payload = RawSample {
        stamp: stamp_ms,
        gyro: [0, 0, gyro_z],
        accel: None,
        enc_left: left,
        enc_right: right,
    }
    .encode();
    FrameCodec::new(config.framing.clone())
        .encode(&payload)
        .unwrap()
        .wire()
        .to_vec()
}

/// Poll until `cond` holds or the deadline passes
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}
