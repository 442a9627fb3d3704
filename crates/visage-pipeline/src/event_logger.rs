// crates/visage-pipeline/src/event_logger.rs
//
// Per-frame event aggregation, plus replay of a prior run's event stream
// aligned to the current run's frame timestamps.
//
// Live path: producers register an event type once, then log payloads against
// a frame; everything collects in that frame's bucket and ships to the
// OutputDriver under the "events" key when the frame reaches late processing.
//
// Replay path: a single worker walks pending frames in ascending order and
// feeds packets from the event file whose (startTime - startOffset) falls
// before the current frame's midpoint. While replay is configured, frames
// cannot leave Processing until their slice of the stream has been applied —
// that is the eventLogger.ran checkpoint.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, error, trace, warn};
use serde_json::{json, Map, Value};

use visage_core::config::ConfigError;
use visage_core::frame::{FrameNumber, FrameStatus, FrameTimestamps};

use crate::error::{PipelineError, Result};
use crate::frame_server::FrameServer;
use crate::output_driver::OutputDriver;
use crate::status::Status;
use crate::worker_pool::{WorkerPool, WorkerPoolParameters};

pub const EVENT_LOGGER_CHECKPOINT: &str = "eventLogger.ran";

/// Decides, for a replayed event, whether it should also be emitted into the
/// current frame's output (return true) or was consumed purely as a
/// side-effect trigger (return false). Receives the event name, its payload,
/// and the whole source packet (with meta.frameNumber already remapped).
pub type ReplayCallback = Box<dyn Fn(&str, &Value, &Value) -> bool + Send>;

pub struct EventType {
    pub name:            String,
    pub replay_callback: ReplayCallback,
}

struct ReplayTask {
    timestamps:       FrameTimestamps,
    ready_for_replay: bool,
}

struct LoggerState {
    registered:     Vec<EventType>,
    frame_events:   HashMap<FrameNumber, Map<String, Value>>,
    pending_replay: BTreeMap<FrameNumber, ReplayTask>,
    reader:         Option<Lines<BufReader<File>>>,
    next_packet:    Option<Value>,
    replay_hold:    bool,
    last_replayed:  Option<FrameNumber>,
}

pub struct EventLogger {
    start_seconds: f64,
    event_replay:  bool,
    status:        Arc<Status>,
    frame_server:  Weak<FrameServer>,
    output_driver: Weak<OutputDriver>,
    state:         Mutex<LoggerState>,
    replay_pool:   OnceLock<WorkerPool>,
}

impl EventLogger {
    /// `event_file` switches on the replay path; `start_seconds` is the
    /// offset of the replay stream relative to the current input. An
    /// unreadable file is fatal here, not at first use.
    pub fn new(
        event_file: Option<&Path>,
        start_seconds: f64,
        status: Arc<Status>,
        output_driver: &Arc<OutputDriver>,
        frame_server: &Arc<FrameServer>,
    ) -> Result<Arc<EventLogger>> {
        if start_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "event replay start seconds must not be negative".into(),
            )
            .into());
        }

        output_driver.register_frame_data("events")?;

        let reader = match event_file {
            Some(path) => Some(BufReader::new(File::open(path)?).lines()),
            None => None,
        };
        let event_replay = reader.is_some();

        let logger = Arc::new(EventLogger {
            start_seconds,
            event_replay,
            status: Arc::clone(&status),
            frame_server: Arc::downgrade(frame_server),
            output_driver: Arc::downgrade(output_driver),
            state: Mutex::new(LoggerState {
                registered: Vec::new(),
                frame_events: HashMap::new(),
                pending_replay: BTreeMap::new(),
                reader,
                next_packet: None,
                replay_hold: false,
                last_replayed: None,
            }),
            replay_pool: OnceLock::new(),
        });

        if event_replay {
            // Frames may not transition away from Processing until their
            // slice of the replay stream has been applied.
            frame_server
                .register_frame_status_checkpoint(FrameStatus::Processing, EVENT_LOGGER_CHECKPOINT)?;
        }

        let on_new = Arc::downgrade(&logger);
        frame_server.on_frame_status_change_event(
            FrameStatus::New,
            Box::new(move |timestamps, _| {
                if let Some(logger) = on_new.upgrade() {
                    logger.handle_frame_new(timestamps);
                }
            }),
        );
        let on_processing = Arc::downgrade(&logger);
        frame_server.on_frame_status_change_event(
            FrameStatus::Processing,
            Box::new(move |timestamps, _| {
                if let Some(logger) = on_processing.upgrade() {
                    logger.handle_frame_processing(timestamps.frame_number);
                }
            }),
        );
        let on_late = Arc::downgrade(&logger);
        frame_server.on_frame_status_change_event(
            FrameStatus::LateProcessing,
            Box::new(move |timestamps, _| {
                if let Some(logger) = on_late.upgrade() {
                    logger.handle_frame_late_processing(timestamps.frame_number);
                }
            }),
        );
        let on_gone = Arc::downgrade(&logger);
        frame_server.on_frame_status_change_event(
            FrameStatus::Gone,
            Box::new(move |timestamps, _| {
                if let Some(logger) = on_gone.upgrade() {
                    logger.state.lock().unwrap().frame_events.remove(&timestamps.frame_number);
                }
            }),
        );

        if event_replay {
            let replay_target = Arc::downgrade(&logger);
            let pool = WorkerPool::new(
                &status,
                frame_server,
                WorkerPoolParameters::with_handler(
                    "EventLogger.Replay",
                    1,
                    Box::new(move |_worker| match replay_target.upgrade() {
                        Some(logger) => logger.replay_pass(),
                        None => Ok(false),
                    }),
                ),
            )?;
            let _ = logger.replay_pool.set(pool);
        }

        debug!("[EventLogger] constructed and ready (replay: {event_replay})");
        Ok(logger)
    }

    /// Event names are unique across the run; re-registration is a
    /// programming error.
    pub fn register_event_type(&self, event_type: EventType) -> Result<()> {
        if event_type.name.is_empty() {
            return Err(PipelineError::UnnamedEventType);
        }
        let mut state = self.state.lock().unwrap();
        if state.registered.iter().any(|e| e.name == event_type.name) {
            return Err(PipelineError::DuplicateEventType(event_type.name));
        }
        state.registered.push(event_type);
        Ok(())
    }

    /// Record an event against a frame's bucket. Unknown event names are
    /// dropped with a warning — an old stream played into a newer pipeline
    /// should degrade, not abort. A missing bucket is a programming error.
    pub fn log_event(
        &self,
        name: &str,
        payload: Value,
        frame_timestamps: FrameTimestamps,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.log_event_locked(&mut state, name, payload, frame_timestamps, false, &Value::Null)
    }

    fn log_event_locked(
        &self,
        state: &mut LoggerState,
        name: &str,
        payload: Value,
        frame: FrameTimestamps,
        propagate: bool,
        source_packet: &Value,
    ) -> Result<()> {
        let Some(index) = state.registered.iter().position(|e| e.name == name) else {
            warn!(
                "[EventLogger] unsupported event type [{name}]; is this stream from a \
                 newer producer?"
            );
            return Ok(());
        };
        if !state.frame_events.contains_key(&frame.frame_number) {
            return Err(PipelineError::UnknownFrame(frame.frame_number));
        }

        let include = if propagate {
            (state.registered[index].replay_callback)(name, &payload, source_packet)
        } else {
            true
        };
        if include {
            let bucket = state.frame_events.get_mut(&frame.frame_number).unwrap();
            match bucket.get_mut(name) {
                None => {
                    bucket.insert(name.to_string(), payload);
                }
                // Repeat logging is only supported array-onto-array.
                Some(Value::Array(existing)) if payload.is_array() => {
                    if let Value::Array(mut incoming) = payload {
                        existing.append(&mut incoming);
                    }
                }
                Some(_) => {
                    return Err(PipelineError::EventCollision {
                        frame: frame.frame_number,
                        key:   name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn handle_frame_new(&self, timestamps: FrameTimestamps) {
        let mut state = self.state.lock().unwrap();
        state
            .frame_events
            .insert(timestamps.frame_number, Map::new());
        if self.event_replay {
            state.pending_replay.insert(
                timestamps.frame_number,
                ReplayTask {
                    timestamps,
                    ready_for_replay: false,
                },
            );
        }
    }

    fn handle_frame_processing(&self, frame_number: FrameNumber) {
        if !self.event_replay {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if let Some(task) = state.pending_replay.get_mut(&frame_number) {
                task.ready_for_replay = true;
            }
        }
        if let Some(pool) = self.replay_pool.get() {
            pool.send_worker_signal();
        }
    }

    fn handle_frame_late_processing(&self, frame_number: FrameNumber) {
        let bucket = {
            let state = self.state.lock().unwrap();
            state.frame_events.get(&frame_number).cloned()
        };
        let Some(bucket) = bucket else {
            error!("[EventLogger] frame #{frame_number} reached late processing without a bucket");
            self.status.set_emergency();
            return;
        };
        let Some(output_driver) = self.output_driver.upgrade() else {
            return;
        };
        if let Err(err) =
            output_driver.insert_frame_data("events", Value::Object(bucket), frame_number)
        {
            error!("[EventLogger] could not hand events to the output driver: {err}");
            self.status.set_emergency();
        }
    }

    /// One replay-pool pass: handle the lowest pending frame that has entered
    /// the gated state, feeding packets until one belongs to a later frame.
    fn replay_pass(&self) -> anyhow::Result<bool> {
        let task = {
            let mut state = self.state.lock().unwrap();
            let next = state
                .pending_replay
                .iter()
                .next()
                .filter(|(_, task)| task.ready_for_replay)
                .map(|(&frame_number, task)| (frame_number, task.timestamps));
            if let Some((frame_number, _)) = next {
                state.pending_replay.remove(&frame_number);
            }
            next
        };
        let Some((_, timestamps)) = task else {
            return Ok(false);
        };
        let frame_number = timestamps.frame_number;

        {
            let mut state = self.state.lock().unwrap();
            if state.last_replayed.is_some_and(|last| frame_number <= last) {
                anyhow::bail!("event replay is handling frames out of order");
            }
            state.last_replayed = Some(frame_number);
            state.replay_hold = false;

            trace!(
                "[EventLogger] replaying up to frame #{frame_number} at {:.3}-{:.3}",
                timestamps.start_timestamp,
                timestamps.estimated_end_timestamp
            );

            // A packet held over from the previous frame goes first.
            self.process_next_packet(&mut state, timestamps)?;
            while !state.replay_hold {
                let line = match state.reader.as_mut().and_then(|reader| reader.next()) {
                    Some(line) => line?,
                    None => break,
                };
                state.next_packet = Some(serde_json::from_str(&line)?);
                self.process_next_packet(&mut state, timestamps)?;
            }
            if state.replay_hold {
                trace!("[EventLogger] holding the buffered packet for a later frame");
            }
        }

        if let Some(frame_server) = self.frame_server.upgrade() {
            frame_server.set_working_frame_status_checkpoint(
                frame_number,
                FrameStatus::Processing,
                EVENT_LOGGER_CHECKPOINT,
            )?;
        }
        Ok(true)
    }

    /// Decide whether the buffered packet maps to "now". Before the current
    /// frame's midpoint: apply it (and complain if it is more than half a
    /// frame early relative to the frame start — a very late packet). At or
    /// past the midpoint: hold it for a later frame.
    fn process_next_packet(
        &self,
        state: &mut LoggerState,
        frame: FrameTimestamps,
    ) -> anyhow::Result<()> {
        if state.next_packet.is_none() {
            return Ok(());
        }

        let half_duration = frame.estimated_duration() / 2.0;
        let frame_start = frame.start_timestamp;
        let frame_end = frame.estimated_end_timestamp - half_duration;
        let packet_time = state.next_packet.as_ref().unwrap()["meta"]["startTime"]
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("replay packet has no numeric meta.startTime"))?
            - self.start_seconds;

        if packet_time >= frame_end {
            state.replay_hold = true;
            return Ok(());
        }

        if packet_time >= 0.0 && packet_time < frame_start - half_duration {
            error!(
                "[EventLogger] replay packet is very late; processing anyway \
                 (packet {packet_time:.3}, frame {frame_start:.3}-{frame_end:.3})"
            );
        }

        let mut packet = state.next_packet.take().unwrap();
        // Downstream consumers key on meta.frameNumber, so remap the source
        // frame to the one this packet lands on in the current run.
        packet["meta"]["frameNumber"] = json!(frame.frame_number);

        let Some(events) = packet.get("events").cloned() else {
            return Ok(());
        };
        if let Value::Object(events) = events {
            for (name, payload) in events {
                self.log_event_locked(state, &name, payload, frame, true, &packet)?;
            }
        }
        Ok(())
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        debug!("[EventLogger] destructing");
        drop(self.replay_pool.take());
        let state = self.state.lock().unwrap();
        if !state.pending_replay.is_empty() {
            error!(
                "[EventLogger] {} frames still pending for replay",
                state.pending_replay.len()
            );
        }
        if !state.frame_events.is_empty() && !self.status.emergency() {
            error!(
                "[EventLogger] {} frame event buckets never drained",
                state.frame_events.len()
            );
        }
    }
}
