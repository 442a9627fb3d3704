// crates/visage-pipeline/src/worker_pool.rs
//
// Named, bounded pool of OS threads sharing one handler, one condition
// variable, and one shutdown protocol. The pool does not order work between
// workers — a component that needs strict ordering (the frame herder, the
// output emitter, event replay) creates its pool with exactly one worker.
//
// A handler returns Ok(true) when it found work, Ok(false) when it found
// none (the worker then parks on the condvar with a 1-second timeout), and
// Err to abort the run: the outer loop catches the error, flips the sticky
// emergency flag, and every pool drains out on its next iteration.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace};

use crate::error::{PipelineError, Result};
use crate::frame_server::FrameServer;
use crate::status::Status;

pub type WorkerHandler = Box<dyn Fn(&Worker) -> anyhow::Result<bool> + Send + Sync>;
pub type WorkerHook = Box<dyn Fn(&Worker) + Send + Sync>;

pub struct WorkerPoolParameters {
    pub name:                String,
    /// Explicit worker count; 0 means derive from `num_workers_per_cpu`.
    pub num_workers:         usize,
    pub num_workers_per_cpu: f64,
    pub initializer:         Option<WorkerHook>,
    pub deinitializer:       Option<WorkerHook>,
    pub handler:             WorkerHandler,
}

impl WorkerPoolParameters {
    /// The common case: a named pool with a handler and nothing else.
    pub fn with_handler(name: &str, num_workers: usize, handler: WorkerHandler) -> Self {
        WorkerPoolParameters {
            name: name.to_string(),
            num_workers,
            num_workers_per_cpu: 0.0,
            initializer: None,
            deinitializer: None,
            handler,
        }
    }
}

/// Handed to the handler on every invocation. Identifies the worker within
/// its pool; handlers use it for log attribution only.
pub struct Worker {
    num:    usize,
    shared: Arc<PoolShared>,
}

impl Worker {
    pub fn num(&self) -> usize {
        self.num
    }

    pub fn pool_name(&self) -> &str {
        &self.shared.name
    }
}

struct PoolState {
    running:              bool,
    frame_server_drained: bool,
}

struct PoolShared {
    name:   String,
    status: Arc<Status>,
    state:  Mutex<PoolState>,
    cond:   Condvar,
}

impl PoolShared {
    fn signal_one(&self) {
        let _guard = self.state.lock().unwrap();
        self.cond.notify_one();
    }

    fn stop_now(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        self.cond.notify_all();
    }

    fn mark_frame_server_drained(&self) {
        let mut state = self.state.lock().unwrap();
        debug!("[WorkerPool<{}>] frame server has drained", self.name);
        if !state.running {
            debug!(
                "[WorkerPool<{}>] drained event came in late; already stopped",
                self.name
            );
            return;
        }
        state.frame_server_drained = true;
        self.cond.notify_all();
    }
}

/// A cheap, cloneable wake-up handle for producers that live outside the
/// owning component (the capture sender uses one). Does not keep the pool
/// alive; signalling a dead pool is a no-op.
#[derive(Clone)]
pub struct WorkerSignal(Weak<PoolShared>);

impl WorkerSignal {
    pub fn signal(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.signal_one();
        }
    }
}

struct PoolHooks {
    initializer:   Option<WorkerHook>,
    deinitializer: Option<WorkerHook>,
    handler:       WorkerHandler,
}

pub struct WorkerPool {
    shared:  Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the workers immediately. The pool hooks into the frame
    /// lifecycle: once the frame server reports drained, idle workers exit on
    /// their own and the destructor joins them without forcing anything.
    pub fn new(
        status: &Arc<Status>,
        frame_server: &FrameServer,
        parameters: WorkerPoolParameters,
    ) -> Result<WorkerPool> {
        let num_workers = if parameters.num_workers == 0 {
            let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            let derived = (cpus as f64 * parameters.num_workers_per_cpu).ceil() as usize;
            debug!(
                "[WorkerPool<{}>] {} CPUs at {:.2} workers per CPU: {} workers",
                parameters.name, cpus, parameters.num_workers_per_cpu, derived
            );
            derived
        } else {
            debug!(
                "[WorkerPool<{}>] worker count explicitly set to {}",
                parameters.name, parameters.num_workers
            );
            parameters.num_workers
        };
        if num_workers < 1 {
            return Err(PipelineError::NoWorkers {
                name: parameters.name,
            });
        }

        let shared = Arc::new(PoolShared {
            name:   parameters.name,
            status: Arc::clone(status),
            state:  Mutex::new(PoolState {
                running:              true,
                frame_server_drained: false,
            }),
            cond:   Condvar::new(),
        });

        // We need to know when the frame server has drained; that is the
        // normal shutdown signal for every pool.
        let drain_target = Arc::downgrade(&shared);
        frame_server.on_frame_server_drained_event(Box::new(move || {
            if let Some(shared) = drain_target.upgrade() {
                shared.mark_frame_server_drained();
            }
        }));

        let hooks = Arc::new(PoolHooks {
            initializer:   parameters.initializer,
            deinitializer: parameters.deinitializer,
            handler:       parameters.handler,
        });

        let mut threads = Vec::with_capacity(num_workers);
        for num in 1..=num_workers {
            let worker = Worker {
                num,
                shared: Arc::clone(&shared),
            };
            let hooks = Arc::clone(&hooks);
            let thread = thread::Builder::new()
                .name(format!("{}-{}", worker.shared.name, num))
                .spawn(move || outer_worker_loop(worker, hooks))?;
            threads.push(thread);
        }

        debug!(
            "[WorkerPool<{}>] constructed with {} workers",
            shared.name, num_workers
        );
        Ok(WorkerPool { shared, threads })
    }

    /// Wake exactly one idle worker.
    pub fn send_worker_signal(&self) {
        self.shared.signal_one();
    }

    /// Stop the pool now: clears `running` and wakes every worker. In-flight
    /// handler invocations finish; queued work is abandoned.
    pub fn stop_worker_now(&self) {
        self.shared.stop_now();
    }

    pub fn signal_handle(&self) -> WorkerSignal {
        WorkerSignal(Arc::downgrade(&self.shared))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        debug!("[WorkerPool<{}>] destructing", self.shared.name);
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.frame_server_drained && state.running {
                error!(
                    "[WorkerPool<{}>] frame server has not finished draining and nobody told \
                     us to stop; forcing shutdown",
                    self.shared.name
                );
                state.running = false;
                self.shared.cond.notify_all();
            }
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn outer_worker_loop(worker: Worker, hooks: Arc<PoolHooks>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| worker_loop(&worker, &hooks)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(
                "[WorkerPool<{}>] uncaught error in worker thread #{}: {:#}",
                worker.shared.name, worker.num, err
            );
            worker.shared.status.set_emergency();
        }
        Err(_) => {
            error!(
                "[WorkerPool<{}>] worker thread #{} panicked",
                worker.shared.name, worker.num
            );
            worker.shared.status.set_emergency();
        }
    }
}

fn worker_loop(worker: &Worker, hooks: &PoolHooks) -> anyhow::Result<()> {
    let shared = &worker.shared;
    debug!("[WorkerPool<{}>] worker thread #{} alive", shared.name, worker.num);

    if let Some(initializer) = &hooks.initializer {
        initializer(worker);
    }

    let mut did_work = false;
    let mut guard = shared.state.lock().unwrap();
    loop {
        if !guard.running {
            break;
        }
        // Drained plus an empty handler pass means there is nothing left to
        // ever do; exiting here is the clean end of a run.
        if guard.frame_server_drained && !did_work {
            break;
        }

        if shared.status.is_paused() && shared.status.is_running() {
            drop(guard);
            thread::sleep(Duration::from_millis(100));
            guard = shared.state.lock().unwrap();
            continue;
        }

        // The handler runs without the pool lock held.
        drop(guard);
        did_work = (hooks.handler)(worker)?;
        guard = shared.state.lock().unwrap();

        if !did_work {
            let (reacquired, timeout) = shared
                .cond
                .wait_timeout(guard, Duration::from_secs(1))
                .unwrap();
            guard = reacquired;
            if timeout.timed_out()
                && !shared.status.is_paused()
                && !guard.frame_server_drained
                && guard.running
            {
                trace!(
                    "[WorkerPool<{}>] worker #{} timed out waiting for a signal",
                    shared.name,
                    worker.num
                );
            }
        }

        if shared.status.emergency() {
            info!(
                "[WorkerPool<{}>] worker #{} honoring emergency stop",
                shared.name, worker.num
            );
            guard.running = false;
        }
    }
    drop(guard);

    if let Some(deinitializer) = &hooks.deinitializer {
        deinitializer(worker);
    }

    debug!("[WorkerPool<{}>] worker thread #{} done", shared.name, worker.num);
    Ok(())
}
