// crates/visage-pipeline/src/image_sequence.rs
//
// Writes each frame's (possibly annotated) preview image to disk as a
// numbered PNG sequence. Holds frames at PreviewDisplay via the
// imageSequence.written checkpoint; the checkpoint is satisfied as soon as
// the preview has been copied out, before the slow encode-and-write, so the
// pipeline never waits on the disk.

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, error, trace, warn};

use visage_core::config::PipelineConfig;
use visage_core::frame::{FrameNumber, FrameStatus};

use crate::error::Result;
use crate::frame_server::FrameServer;
use crate::metrics::Metrics;
use crate::status::Status;
use crate::worker_pool::{Worker, WorkerPool, WorkerPoolParameters};

pub const IMAGE_SEQUENCE_CHECKPOINT: &str = "imageSequence.written";

pub struct ImageSequence {
    output_prefix: String,
    frame_server:  Weak<FrameServer>,
    metrics:       Metrics,
    pending:       Mutex<VecDeque<FrameNumber>>,
    pool:          OnceLock<WorkerPool>,
}

impl ImageSequence {
    /// Files land at `"{output_prefix}-{frame:06}.png"`.
    pub fn new(
        config: &PipelineConfig,
        status: &Arc<Status>,
        frame_server: &Arc<FrameServer>,
        output_prefix: &str,
    ) -> Result<Arc<ImageSequence>> {
        let sequence = Arc::new(ImageSequence {
            output_prefix: output_prefix.to_string(),
            frame_server:  Arc::downgrade(frame_server),
            metrics:       Metrics::new(&config.metrics, "ImageSequence", true),
            pending:       Mutex::new(VecDeque::new()),
            pool:          OnceLock::new(),
        });

        // Frames may not transition away from PreviewDisplay until their
        // preview has been captured for writing.
        frame_server
            .register_frame_status_checkpoint(FrameStatus::PreviewDisplay, IMAGE_SEQUENCE_CHECKPOINT)?;

        // Nothing but record-and-signal happens in the callback; operating on
        // the frame from here would deadlock.
        let on_preview = Arc::downgrade(&sequence);
        frame_server.on_frame_status_change_event(
            FrameStatus::PreviewDisplay,
            Box::new(move |timestamps, _| {
                if let Some(sequence) = on_preview.upgrade() {
                    sequence
                        .pending
                        .lock()
                        .unwrap()
                        .push_back(timestamps.frame_number);
                    if let Some(pool) = sequence.pool.get() {
                        pool.send_worker_signal();
                    }
                }
            }),
        );

        let write_target = Arc::downgrade(&sequence);
        let pool = WorkerPool::new(
            status,
            frame_server,
            WorkerPoolParameters {
                name:                "ImageSequence".to_string(),
                num_workers:         config.image_sequence.num_workers,
                num_workers_per_cpu: config.image_sequence.num_workers_per_cpu,
                initializer:         None,
                deinitializer:       None,
                handler:             Box::new(move |worker| match write_target.upgrade() {
                    Some(sequence) => sequence.write_pass(worker),
                    None => Ok(false),
                }),
            },
        )?;
        let _ = sequence.pool.set(pool);

        debug!(
            "[ImageSequence] constructed with output prefix {}",
            sequence.output_prefix
        );
        Ok(sequence)
    }

    fn write_pass(&self, worker: &Worker) -> anyhow::Result<bool> {
        let Some(frame_number) = self.pending.lock().unwrap().pop_front() else {
            return Ok(false);
        };
        let Some(frame_server) = self.frame_server.upgrade() else {
            return Ok(false);
        };

        let tick = self.metrics.start_clock();
        let view = frame_server.get_working_frame(frame_number)?;
        let preview = view.preview_frame.lock().unwrap().clone();

        frame_server.set_working_frame_status_checkpoint(
            frame_number,
            FrameStatus::PreviewDisplay,
            IMAGE_SEQUENCE_CHECKPOINT,
        )?;

        if preview.is_empty() {
            warn!("[ImageSequence] preview for frame #{frame_number} is empty; nothing to write");
        } else {
            let filename = format!("{}-{:06}.png", self.output_prefix, frame_number);
            trace!(
                "[ImageSequence] worker #{} writing preview frame #{} to {}",
                worker.num(),
                frame_number,
                filename
            );
            let file = File::create(&filename)?;
            let writer = &mut BufWriter::new(file);
            let mut encoder = png::Encoder::new(writer, preview.width(), preview.height());
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut png_writer = encoder.write_header()?;
            png_writer.write_image_data(preview.data())?;
        }

        self.metrics.end_clock(tick);
        Ok(true)
    }
}

impl Drop for ImageSequence {
    fn drop(&mut self) {
        debug!("[ImageSequence] destructing");
        drop(self.pool.take());
        let pending = self.pending.lock().unwrap();
        if !pending.is_empty() {
            error!("[ImageSequence] {} frames still pending", pending.len());
        }
    }
}
