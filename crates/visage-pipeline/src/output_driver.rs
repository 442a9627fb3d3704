// crates/visage-pipeline/src/output_driver.rs
//
// Ordered multi-producer output assembly. Producers declare their keys at
// startup; each frame gets a pending container that collects one value per
// key and is emitted as a single JSON line once the frame is draining and
// every declared value has arrived. Emission is strictly once per frame, in
// strictly ascending frame-number order — frame k+1 never goes out before
// frame k, no matter which producer finished first.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, error, info};
use serde_json::{json, Map, Value};

use visage_core::frame::{FrameNumber, FrameStatus, FrameTimestamps};

use crate::error::{PipelineError, Result};
use crate::frame_server::FrameServer;
use crate::status::Status;
use crate::worker_pool::{WorkerPool, WorkerPoolParameters};

pub const OUTPUT_DRIVER_CHECKPOINT: &str = "outputDriver.ran";

struct OutputFrameContainer {
    timestamps:        FrameTimestamps,
    frame_is_draining: bool,
    output_processed:  bool,
    waiting_on:        HashMap<String, bool>,
    fields:            Map<String, Value>,
}

impl OutputFrameContainer {
    fn is_ready(&self) -> bool {
        self.frame_is_draining && self.waiting_on.values().all(|arrived| *arrived)
    }
}

struct DriverState {
    registered_keys:        Vec<String>,
    insertion_started:      bool,
    pending_frames:         BTreeMap<FrameNumber, OutputFrameContainer>,
    auto_basis_transmitted: bool,
    basis_flagged:          bool,
    last_basis:             Option<Value>,
    frame_server_drained:   bool,
}

pub struct OutputDriver {
    status:       Arc<Status>,
    frame_server: Weak<FrameServer>,
    state:        Mutex<DriverState>,
    sinks:        Mutex<Vec<Box<dyn Write + Send>>>,
    pool:         OnceLock<WorkerPool>,
}

impl OutputDriver {
    pub fn new(status: Arc<Status>, frame_server: &Arc<FrameServer>) -> Result<Arc<OutputDriver>> {
        let driver = Arc::new(OutputDriver {
            status: Arc::clone(&status),
            frame_server: Arc::downgrade(frame_server),
            state: Mutex::new(DriverState {
                registered_keys:        Vec::new(),
                insertion_started:      false,
                pending_frames:         BTreeMap::new(),
                auto_basis_transmitted: false,
                basis_flagged:          false,
                last_basis:             None,
                frame_server_drained:   false,
            }),
            sinks: Mutex::new(Vec::new()),
            pool: OnceLock::new(),
        });

        // Frames cannot leave Draining until their line has been written.
        frame_server.register_frame_status_checkpoint(
            FrameStatus::Draining,
            OUTPUT_DRIVER_CHECKPOINT,
        )?;

        let on_new = Arc::downgrade(&driver);
        frame_server.on_frame_status_change_event(
            FrameStatus::New,
            Box::new(move |timestamps, _| {
                if let Some(driver) = on_new.upgrade() {
                    driver.handle_new_frame(timestamps);
                }
            }),
        );
        let on_draining = Arc::downgrade(&driver);
        frame_server.on_frame_status_change_event(
            FrameStatus::Draining,
            Box::new(move |timestamps, _| {
                if let Some(driver) = on_draining.upgrade() {
                    driver.handle_frame_draining(timestamps.frame_number);
                }
            }),
        );
        let on_gone = Arc::downgrade(&driver);
        frame_server.on_frame_status_change_event(
            FrameStatus::Gone,
            Box::new(move |timestamps, _| {
                if let Some(driver) = on_gone.upgrade() {
                    driver.handle_frame_gone(timestamps.frame_number);
                }
            }),
        );
        let on_drained = Arc::downgrade(&driver);
        frame_server.on_frame_server_drained_event(Box::new(move || {
            if let Some(driver) = on_drained.upgrade() {
                driver.state.lock().unwrap().frame_server_drained = true;
            }
        }));

        // Exactly one worker: ascending, exactly-once emission is the
        // contract, so the pool must not race itself.
        let emit_target = Arc::downgrade(&driver);
        let pool = WorkerPool::new(
            &status,
            frame_server,
            WorkerPoolParameters::with_handler(
                "OutputDriver",
                1,
                Box::new(move |_worker| match emit_target.upgrade() {
                    Some(driver) => driver.emit_pass(),
                    None => Ok(false),
                }),
            ),
        )?;
        let _ = driver.pool.set(pool);

        debug!("[OutputDriver] constructed and ready");
        Ok(driver)
    }

    /// Declare a per-frame output key. Every frame emitted afterwards waits
    /// for this key to be filled exactly once. Must precede the first frame.
    pub fn register_frame_data(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.insertion_started {
            return Err(PipelineError::RegistrationAfterInsert);
        }
        if state.registered_keys.iter().any(|k| k == key) {
            return Err(PipelineError::DuplicateFrameDataKey(key.to_string()));
        }
        state.registered_keys.push(key.to_string());
        Ok(())
    }

    /// Fill `key` for `frame_number`. The value may be `Value::Null` — a
    /// producer that failed on this frame still reports, it just reports
    /// nothing.
    pub fn insert_frame_data(&self, key: &str, value: Value, frame_number: FrameNumber) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.frame_server_drained {
                return Err(PipelineError::AlreadyDrained);
            }
            if !state.registered_keys.iter().any(|k| k == key) {
                return Err(PipelineError::UnknownFrameDataKey(key.to_string()));
            }
            let container = state
                .pending_frames
                .get_mut(&frame_number)
                .ok_or(PipelineError::UnknownFrame(frame_number))?;
            let arrived = container.waiting_on.get_mut(key).ok_or_else(|| {
                PipelineError::UnknownFrameDataKey(key.to_string())
            })?;
            if *arrived {
                return Err(PipelineError::FrameDataAlreadySet {
                    frame: frame_number,
                    key:   key.to_string(),
                });
            }
            *arrived = true;
            container.fields.insert(key.to_string(), value);
        }
        if let Some(pool) = self.pool.get() {
            pool.send_worker_signal();
        }
        Ok(())
    }

    /// Operator request: mark the next emitted frame as a new basis pose.
    pub fn new_basis_event(&self) {
        self.state.lock().unwrap().basis_flagged = true;
        if let Some(pool) = self.pool.get() {
            pool.send_worker_signal();
        }
    }

    /// The most recent frame emitted with `meta.basis == true`, if any.
    pub fn last_basis(&self) -> Option<Value> {
        self.state.lock().unwrap().last_basis.clone()
    }

    pub fn add_sink(&self, sink: Box<dyn Write + Send>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn open_file_sink(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        self.add_sink(Box::new(BufWriter::new(file)));
        Ok(())
    }

    fn handle_new_frame(&self, timestamps: FrameTimestamps) {
        let mut state = self.state.lock().unwrap();
        state.insertion_started = true;
        let waiting_on = state
            .registered_keys
            .iter()
            .map(|key| (key.clone(), false))
            .collect();
        state.pending_frames.insert(
            timestamps.frame_number,
            OutputFrameContainer {
                timestamps,
                frame_is_draining: false,
                output_processed: false,
                waiting_on,
                fields: Map::new(),
            },
        );
    }

    fn handle_frame_draining(&self, frame_number: FrameNumber) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(container) = state.pending_frames.get_mut(&frame_number) {
                container.frame_is_draining = true;
            }
        }
        if let Some(pool) = self.pool.get() {
            pool.send_worker_signal();
        }
    }

    fn handle_frame_gone(&self, frame_number: FrameNumber) {
        let mut state = self.state.lock().unwrap();
        match state.pending_frames.remove(&frame_number) {
            Some(container) if !container.output_processed => {
                // Unreachable in a healthy run: the Draining checkpoint only
                // clears after emission.
                error!("[OutputDriver] frame #{frame_number} went away without being emitted");
            }
            Some(_) => {}
            None => error!("[OutputDriver] frame #{frame_number} gone but never had a container"),
        }
    }

    /// Emit every frame that is ready, lowest frame number first, stopping at
    /// the first frame that is not. Runs on the single pool worker.
    fn emit_pass(&self) -> anyhow::Result<bool> {
        let mut did_work = false;
        loop {
            let (frame_number, line) = {
                let mut state = self.state.lock().unwrap();
                let next = state
                    .pending_frames
                    .iter()
                    .find(|(_, container)| !container.output_processed)
                    .map(|(number, container)| (*number, container.is_ready()));
                match next {
                    Some((number, true)) => {
                        let record = Self::build_record(&mut state, number);
                        state
                            .pending_frames
                            .get_mut(&number)
                            .unwrap()
                            .output_processed = true;
                        (number, record.to_string())
                    }
                    // Next unemitted frame not ready (or nothing pending):
                    // stop — emitting anything later would break ordering.
                    _ => break,
                }
            };

            self.write_line(&line)?;
            if let Some(frame_server) = self.frame_server.upgrade() {
                frame_server.set_working_frame_status_checkpoint(
                    frame_number,
                    FrameStatus::Draining,
                    OUTPUT_DRIVER_CHECKPOINT,
                )?;
            }
            did_work = true;
        }
        Ok(did_work)
    }

    fn build_record(state: &mut DriverState, frame_number: FrameNumber) -> Value {
        let container = &state.pending_frames[&frame_number];
        let timestamps = container.timestamps;

        // Automatic basis: the first frame whose declared values are all
        // substantive. After that, only explicit basis events flag frames.
        let all_values_present = container.fields.values().all(|value| !value.is_null());
        let mut basis = false;
        if !state.auto_basis_transmitted && all_values_present {
            state.auto_basis_transmitted = true;
            basis = true;
            info!("[OutputDriver] all properties set; transmitting initial basis flag automatically");
        }
        if state.basis_flagged {
            state.auto_basis_transmitted = true;
            state.basis_flagged = false;
            basis = true;
            info!("[OutputDriver] transmitting basis flag for a received basis event");
        }

        let container = &state.pending_frames[&frame_number];
        let mut record = json!({
            "meta": {
                "frameNumber": timestamps.frame_number,
                "startTime":   timestamps.start_timestamp,
                "basis":       basis,
            }
        });
        for (key, value) in &container.fields {
            record[key] = value.clone();
        }
        if basis {
            state.last_basis = Some(record.clone());
        }
        record
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut sinks = self.sinks.lock().unwrap();
        for sink in sinks.iter_mut() {
            sink.write_all(line.as_bytes())?;
            sink.write_all(b"\n")?;
            sink.flush()?;
        }
        Ok(())
    }
}

impl Drop for OutputDriver {
    fn drop(&mut self) {
        debug!("[OutputDriver] destructing");
        drop(self.pool.take());
        let state = self.state.lock().unwrap();
        let unemitted = state
            .pending_frames
            .values()
            .filter(|container| !container.output_processed)
            .count();
        if unemitted > 0 && !self.status.emergency() {
            error!("[OutputDriver] {unemitted} frames were never emitted");
        }
    }
}
