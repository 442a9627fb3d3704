// crates/visage-pipeline/src/capture.rs
//
// Decoder-facing ingest: a bounded channel of decoded frames and a
// single-worker pump that feeds them into the FrameServer. The decoder side
// only ever sees a FrameSender; dropping the last sender is the end-of-stream
// signal and puts the server into draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::debug;

use visage_core::config::PipelineConfig;
use visage_core::frame::VideoFrame;

use crate::error::{PipelineError, Result};
use crate::frame_server::FrameServer;
use crate::status::Status;
use crate::worker_pool::{WorkerPool, WorkerPoolParameters, WorkerSignal};

/// The decoder's handle. Cloneable; `send` blocks while the buffer is full,
/// which is the upstream backpressure ahead of the frame store's own.
#[derive(Clone)]
pub struct FrameSender {
    tx:     Sender<VideoFrame>,
    signal: WorkerSignal,
}

impl FrameSender {
    pub fn send(&self, frame: VideoFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| PipelineError::CaptureClosed)?;
        self.signal.signal();
        Ok(())
    }
}

pub struct FrameCapture {
    _pool: WorkerPool,
}

impl FrameCapture {
    pub fn new(
        config: &PipelineConfig,
        status: &Arc<Status>,
        frame_server: &Arc<FrameServer>,
    ) -> Result<(FrameCapture, FrameSender)> {
        let (tx, rx) = bounded::<VideoFrame>(config.capture.buffer_frames);

        let server: Weak<FrameServer> = Arc::downgrade(frame_server);
        let closed = Arc::new(AtomicBool::new(false));
        let pool = WorkerPool::new(
            status,
            frame_server,
            WorkerPoolParameters::with_handler(
                "FrameCapture",
                1,
                Box::new(move |_worker| pump(&rx, &server, &closed)),
            ),
        )?;

        let sender = FrameSender {
            tx,
            signal: pool.signal_handle(),
        };
        Ok((FrameCapture { _pool: pool }, sender))
    }
}

fn pump(
    rx: &Receiver<VideoFrame>,
    server: &Weak<FrameServer>,
    closed: &AtomicBool,
) -> anyhow::Result<bool> {
    let Some(frame_server) = server.upgrade() else {
        return Ok(false);
    };
    let mut did_work = false;
    loop {
        match rx.try_recv() {
            Ok(frame) => {
                // Blocks here under low-latency backpressure; the channel
                // buffers behind us in the meantime.
                frame_server.insert_new_frame(frame)?;
                did_work = true;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                if !closed.swap(true, Ordering::SeqCst) {
                    debug!("[FrameCapture] every sender dropped; end of stream");
                    frame_server.set_draining();
                }
                break;
            }
        }
    }
    Ok(did_work)
}
