// crates/visage-pipeline/src/frame_server.rs
//
// Owns the frame store and advances every frame through the lifecycle
// states, gated by registered checkpoints. All advancement happens on a
// single-worker "herder" pool so state entry is strictly ordered by frame
// number.
//
// Wiring order for an assembly: Status, then FrameServer, then OutputDriver /
// EventLogger / analyzers (each registering callbacks and checkpoints), then
// the capture feed. Checkpoints and frame-data keys must all be registered
// before the first frame is inserted.
//
// Status-change callbacks fire synchronously while the FrameServer lock is
// held. A callback must not call back into the FrameServer or take another
// component's heavy lock; the only safe moves are recording the frame number
// and signalling the callback owner's worker pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use visage_core::config::{ConfigError, PipelineConfig};
use visage_core::frame::{FrameNumber, FrameStatus, FrameTimestamps, VideoFrame};
use visage_core::image::ImageBuffer;

use crate::error::{PipelineError, Result};
use crate::metrics::Metrics;
use crate::status::Status;
use crate::worker_pool::{WorkerPool, WorkerPoolParameters};

pub type FrameStatusCallback = Box<dyn Fn(FrameTimestamps, FrameStatus) + Send>;
pub type FrameServerDrainedCallback = Box<dyn Fn() + Send>;

/// One frame's record while it lives in the store.
struct WorkingFrame {
    timestamps:             FrameTimestamps,
    status:                 FrameStatus,
    detection_scale_factor: f64,
    /// Native-resolution image; dropped once the preview has been displayed.
    frame:                  Option<Arc<ImageBuffer>>,
    /// Downscaled copy for detection; dropped with `frame`.
    detection_frame:        Option<Arc<ImageBuffer>>,
    /// Annotated in parallel by preview renderers — its own mutex, never
    /// touched by the herder beyond the release step.
    preview_frame:          Arc<Mutex<ImageBuffer>>,
    checkpoints:            [HashMap<String, bool>; FrameStatus::COUNT],
}

impl WorkingFrame {
    fn checkpoints_passed(&self) -> bool {
        self.checkpoints[self.status.ordinal()]
            .values()
            .all(|satisfied| *satisfied)
    }

    fn release_images(&mut self) {
        self.frame = None;
        self.detection_frame = None;
        self.preview_frame.lock().unwrap().release();
    }
}

/// Immutable snapshot of a working frame handed to analyzers. Image handles
/// are shared, not copied; `frame` and `detection_frame` are `None` once the
/// frame has passed preview display.
#[derive(Clone)]
pub struct WorkingFrameView {
    pub timestamps:             FrameTimestamps,
    pub status:                 FrameStatus,
    pub detection_scale_factor: f64,
    pub frame:                  Option<Arc<ImageBuffer>>,
    pub detection_frame:        Option<Arc<ImageBuffer>>,
    /// Lock before reading or writing.
    pub preview_frame:          Arc<Mutex<ImageBuffer>>,
}

struct ServerState {
    draining:          bool,
    mirror_mode:       bool,
    insertion_started: bool,
    reported_scale:    bool,
    next_frame_number: FrameNumber,
    frame_store:       BTreeMap<FrameNumber, WorkingFrame>,
    checkpoints:       [Vec<String>; FrameStatus::COUNT],
    status_callbacks:  [Vec<FrameStatusCallback>; FrameStatus::COUNT],
    drained_callbacks: Vec<FrameServerDrainedCallback>,
}

pub struct FrameServer {
    low_latency:            bool,
    max_queue_depth:        usize,
    detection_bounding_box: u32,
    detection_scale_factor: f64,
    status:                 Arc<Status>,
    metrics:                Metrics,
    state:                  Mutex<ServerState>,
    herder:                 OnceLock<WorkerPool>,
}

impl FrameServer {
    pub fn new(
        config: &PipelineConfig,
        status: Arc<Status>,
        low_latency: bool,
    ) -> Result<Arc<FrameServer>> {
        let profile = if low_latency {
            &config.frame_server.low_latency
        } else {
            &config.frame_server.offline
        };
        if profile.detection_scale_factor <= 0.0 || profile.detection_scale_factor > 1.0 {
            return Err(ConfigError::Invalid(
                "detection scale factor must be in (0, 1]".into(),
            )
            .into());
        }

        let server = Arc::new(FrameServer {
            low_latency,
            max_queue_depth: profile.max_queue_depth,
            detection_bounding_box: profile.detection_bounding_box,
            detection_scale_factor: profile.detection_scale_factor,
            status: Arc::clone(&status),
            metrics: Metrics::new(&config.metrics, "FrameServer", false),
            state: Mutex::new(ServerState {
                draining:          false,
                mirror_mode:       false,
                insertion_started: false,
                reported_scale:    false,
                next_frame_number: 1,
                frame_store:       BTreeMap::new(),
                checkpoints:       std::array::from_fn(|_| Vec::new()),
                status_callbacks:  std::array::from_fn(|_| Vec::new()),
                drained_callbacks: Vec::new(),
            }),
            herder: OnceLock::new(),
        });

        let herd_target = Arc::downgrade(&server);
        let drain_target = Arc::downgrade(&server);
        let herder = WorkerPool::new(
            &status,
            &server,
            WorkerPoolParameters {
                name:                "FrameServer.Herder".to_string(),
                num_workers:         1,
                num_workers_per_cpu: 0.0,
                initializer:         None,
                // The herder's exit is the moment the drain is complete; the
                // drained event fans out from here (skipped on emergency).
                deinitializer:       Some(Box::new(move |_worker| {
                    if let Some(server) = drain_target.upgrade() {
                        server.fire_drained_callbacks();
                    }
                })),
                handler:             Box::new(move |_worker| {
                    Ok(herd_target
                        .upgrade()
                        .map(|server| server.herd())
                        .unwrap_or(false))
                }),
            },
        )?;
        let _ = server.herder.set(herder);

        debug!("[FrameServer] constructed and ready");
        Ok(server)
    }

    /// Register a listener fired whenever any frame enters `status`. Fires
    /// synchronously under the FrameServer lock — record and signal only.
    pub fn on_frame_status_change_event(&self, status: FrameStatus, callback: FrameStatusCallback) {
        let mut state = self.state.lock().unwrap();
        state.status_callbacks[status.ordinal()].push(callback);
    }

    /// Register a terminal listener fired exactly once, after draining has
    /// completed and the frame store is empty.
    pub fn on_frame_server_drained_event(&self, callback: FrameServerDrainedCallback) {
        let mut state = self.state.lock().unwrap();
        state.drained_callbacks.push(callback);
    }

    /// Declare that `status` is gated by `key` for every frame inserted from
    /// here on. Must happen before the first insertion.
    pub fn register_frame_status_checkpoint(&self, status: FrameStatus, key: &str) -> Result<()> {
        if status == FrameStatus::Gone {
            // Gone means the frame is about to be cleaned up; nothing may
            // hold it there.
            return Err(PipelineError::CheckpointOnGone);
        }
        let mut state = self.state.lock().unwrap();
        if state.insertion_started {
            return Err(PipelineError::RegistrationAfterInsert);
        }
        if state.checkpoints[status.ordinal()].iter().any(|k| k == key) {
            return Err(PipelineError::DuplicateCheckpoint {
                status,
                key: key.to_string(),
            });
        }
        state.checkpoints[status.ordinal()].push(key.to_string());
        Ok(())
    }

    /// Assign the next frame number, snapshot the images, and enter the frame
    /// into the store at `New`. In low-latency mode this blocks while the
    /// store is at `max_queue_depth` — that is the pipeline's backpressure.
    pub fn insert_new_frame(&self, video_frame: VideoFrame) -> Result<FrameNumber> {
        let tick = self.metrics.start_clock();
        let mut state = self.state.lock().unwrap();
        if state.draining {
            return Err(PipelineError::Draining);
        }

        if self.low_latency && state.frame_store.len() >= self.max_queue_depth {
            error!(
                "[FrameServer] frame store hit the maximum queue depth of {}; insert is now \
                 blocked — if this repeats, consider tuning",
                self.max_queue_depth
            );
            while state.frame_store.len() >= self.max_queue_depth {
                drop(state);
                if self.status.emergency() {
                    return Err(PipelineError::EmergencyStop);
                }
                thread::sleep(Duration::from_millis(5));
                state = self.state.lock().unwrap();
            }
        }

        state.insertion_started = true;
        let frame_number = state.next_frame_number;
        state.next_frame_number += 1;

        let VideoFrame {
            image,
            start_timestamp,
            estimated_end_timestamp,
        } = video_frame;
        let timestamps = FrameTimestamps {
            frame_number,
            start_timestamp,
            estimated_end_timestamp,
        };

        let preview = if state.mirror_mode {
            image.flipped_horizontal()
        } else {
            image.clone()
        };

        let scale_factor = if self.detection_bounding_box > 0 {
            f64::from(self.detection_bounding_box)
                / f64::from(image.width().max(image.height()).max(1))
        } else {
            self.detection_scale_factor
        };
        let detection = image.downscaled(scale_factor);
        if !state.reported_scale {
            debug!(
                "[FrameServer] scaled <{}x{}> down to <{}x{}> for detection",
                image.width(),
                image.height(),
                detection.width(),
                detection.height()
            );
            state.reported_scale = true;
        }

        let mut checkpoints: [HashMap<String, bool>; FrameStatus::COUNT] =
            std::array::from_fn(|_| HashMap::new());
        for (ordinal, keys) in state.checkpoints.iter().enumerate() {
            for key in keys {
                checkpoints[ordinal].insert(key.clone(), false);
            }
        }

        state.frame_store.insert(
            frame_number,
            WorkingFrame {
                timestamps,
                status: FrameStatus::New,
                detection_scale_factor: scale_factor,
                frame: Some(Arc::new(image)),
                detection_frame: Some(Arc::new(detection)),
                preview_frame: Arc::new(Mutex::new(preview)),
                checkpoints,
            },
        );
        trace!(
            "[FrameServer] inserted frame #{frame_number}; store size is now {}",
            state.frame_store.len()
        );

        Self::set_frame_status(&mut state, timestamps, FrameStatus::New);
        drop(state);

        self.metrics.end_clock(tick);
        if let Some(herder) = self.herder.get() {
            herder.send_worker_signal();
        }
        Ok(frame_number)
    }

    pub fn get_working_frame(&self, frame_number: FrameNumber) -> Result<WorkingFrameView> {
        let state = self.state.lock().unwrap();
        let frame = state
            .frame_store
            .get(&frame_number)
            .ok_or(PipelineError::UnknownFrame(frame_number))?;
        Ok(WorkingFrameView {
            timestamps:             frame.timestamps,
            status:                 frame.status,
            detection_scale_factor: frame.detection_scale_factor,
            frame:                  frame.frame.clone(),
            detection_frame:        frame.detection_frame.clone(),
            preview_frame:          Arc::clone(&frame.preview_frame),
        })
    }

    /// Satisfy `key` for the frame's *current* state. Anything else — unknown
    /// frame, state mismatch, unregistered key, double satisfaction — is a
    /// programming error.
    pub fn set_working_frame_status_checkpoint(
        &self,
        frame_number: FrameNumber,
        status: FrameStatus,
        key: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let frame = state
            .frame_store
            .get_mut(&frame_number)
            .ok_or(PipelineError::UnknownFrame(frame_number))?;
        if frame.status != status {
            return Err(PipelineError::CheckpointStatusMismatch {
                frame:     frame_number,
                requested: status,
                actual:    frame.status,
                key:       key.to_string(),
            });
        }
        let satisfied = frame.checkpoints[status.ordinal()].get_mut(key).ok_or_else(|| {
            PipelineError::UnknownCheckpoint {
                status,
                key: key.to_string(),
            }
        })?;
        if *satisfied {
            return Err(PipelineError::CheckpointAlreadySet {
                frame: frame_number,
                key:   key.to_string(),
            });
        }
        *satisfied = true;
        drop(state);

        if let Some(herder) = self.herder.get() {
            herder.send_worker_signal();
        }
        Ok(())
    }

    /// Idempotently stop accepting input. The run ends once the store empties.
    pub fn set_draining(&self) {
        let mut state = self.state.lock().unwrap();
        if state.draining {
            debug!("[FrameServer] set_draining called again; already draining");
            return;
        }
        state.draining = true;
        info!("[FrameServer] set to draining");

        // The whole queue may already have been processed by the time we
        // learn the input has closed.
        let drained = state.frame_store.is_empty();
        drop(state);
        if drained {
            if let Some(herder) = self.herder.get() {
                herder.stop_worker_now();
            }
        }
    }

    pub fn is_drained(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.draining && state.frame_store.is_empty()
    }

    /// Horizontal flip applied to the preview image at insertion time.
    pub fn set_mirror_mode(&self, mirror_mode: bool) {
        self.state.lock().unwrap().mirror_mode = mirror_mode;
    }

    fn set_frame_status(state: &mut ServerState, timestamps: FrameTimestamps, status: FrameStatus) {
        if let Some(frame) = state.frame_store.get_mut(&timestamps.frame_number) {
            frame.status = status;
        }
        trace!(
            "[FrameServer] frame #{} entering {:?}",
            timestamps.frame_number,
            status
        );
        for callback in &state.status_callbacks[status.ordinal()] {
            callback(timestamps, status);
        }
    }

    /// One herder pass: walk the store in ascending frame-number order,
    /// advance every frame whose gates are all satisfied, and purge frames
    /// that have reached `Gone`.
    fn herd(&self) -> bool {
        let mut did_work = false;
        let mut garbage: Vec<FrameNumber> = Vec::new();
        let mut state = self.state.lock().unwrap();

        // A frame may enter a state only after every lower-numbered frame
        // has; `floor` carries the predecessor's (possibly just-advanced)
        // state down the walk.
        let mut floor = FrameStatus::Gone;
        let numbers: Vec<FrameNumber> = state.frame_store.keys().copied().collect();
        for number in numbers {
            let frame = &state.frame_store[&number];
            let status = frame.status;

            if status == FrameStatus::Gone {
                did_work = true;
                garbage.push(number);
                floor = FrameStatus::Gone;
                continue;
            }

            let next = status.next();
            if frame.checkpoints_passed() && next <= floor {
                let frame = state.frame_store.get_mut(&number).unwrap();
                if status == FrameStatus::PreviewDisplay {
                    // Bounded-memory cut: once the preview has been shown,
                    // late processing only reads timestamps and metadata.
                    frame.release_images();
                }
                let timestamps = frame.timestamps;
                did_work = true;
                Self::set_frame_status(&mut state, timestamps, next);
                floor = next;
            } else {
                floor = status;
            }
        }

        for number in garbage {
            trace!("[FrameServer] cleaning up gone frame #{number}");
            state.frame_store.remove(&number);
        }

        let drained = state.draining && state.frame_store.is_empty();
        drop(state);
        if drained {
            if let Some(herder) = self.herder.get() {
                herder.stop_worker_now();
            }
        }
        did_work
    }

    fn fire_drained_callbacks(&self) {
        if self.status.emergency() {
            return;
        }
        let state = self.state.lock().unwrap();
        for callback in &state.drained_callbacks {
            callback();
        }
    }
}

impl Drop for FrameServer {
    fn drop(&mut self) {
        debug!("[FrameServer] destructing");
        {
            let mut state = self.state.lock().unwrap();
            if !state.draining {
                warn!(
                    "[FrameServer] was never set to draining; always drain before dropping"
                );
                state.draining = true;
            }
        }
        // Joins the herder.
        drop(self.herder.take());

        let state = self.state.lock().unwrap();
        if !state.frame_store.is_empty() {
            error!(
                "[FrameServer] {} frames still in the frame store; draining did not complete",
                state.frame_store.len()
            );
        }
    }
}
