// crates/visage-pipeline/tests/common/mod.rs
//
// Shared plumbing for the end-to-end pipeline tests: logging init, synthetic
// frames, a memory-backed output sink, and a poll-until helper.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use visage_pipeline::{ImageBuffer, VideoFrame};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_frame(start: f64, end: f64) -> VideoFrame {
    VideoFrame {
        image:                   ImageBuffer::filled(8, 8, [32, 64, 96, 255]),
        start_timestamp:         start,
        estimated_end_timestamp: end,
    }
}

/// Spin until `cond` holds, failing the test after `timeout`.
pub fn wait_for(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// An output sink writing into shared memory, so tests can assert on the
/// emitted JSON lines.
#[derive(Clone)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn new() -> SharedSink {
        SharedSink(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).expect("output sink is not UTF-8");
        text.lines()
            .map(|line| serde_json::from_str(line).expect("output line is not valid JSON"))
            .collect()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
