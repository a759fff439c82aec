//! Thread pool for running scripts from any thread.
//!
//! Engines and contexts are bound to the thread that created them. A
//! [`WorkerPool`] owns N dedicated threads, each with its own [`Engine`],
//! and hands out a [`WorkerHandle`] that is `Send + Sync + Clone`. Every job
//! runs in a fresh context, so only host values cross threads.
//!
//! # Example
//!
//! ```no_run
//! use ember_runtime::{HostValue, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = WorkerPool::builder().pool_size(2).build().unwrap();
//!     let handle = pool.handle();
//!
//!     let (value, _) = handle.execute("<?php return 6 * 7;").await.unwrap();
//!     assert_eq!(value, HostValue::Int(42));
//!
//!     pool.shutdown().await;
//! }
//! ```

use crate::context::ExecResult;
use crate::engine::{Engine, EngineBuilder};
use crate::error::{EmberError, EmberResult, ScriptFailure};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use ember_core::HostValue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, warn};

/// Worker stack size. Deeply recursive scripts need more than the default.
const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Statistics about pool operation
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of jobs submitted to the pool
    pub jobs_submitted: AtomicU64,
    /// Total number of jobs completed (successfully or with error)
    pub jobs_completed: AtomicU64,
    /// Number of jobs that failed with an error
    pub jobs_failed: AtomicU64,
    /// Engines restarted after a fault
    pub engine_restarts: AtomicU64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            engine_restarts: self.engine_restarts.load(Ordering::Relaxed),
        }
    }

    /// Jobs submitted but not yet answered
    pub fn jobs_in_flight(&self) -> u64 {
        let submitted = self.jobs_submitted.load(Ordering::Relaxed);
        let completed = self.jobs_completed.load(Ordering::Relaxed);
        submitted.saturating_sub(completed)
    }
}

/// A point-in-time snapshot of pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub engine_restarts: u64,
}

impl PoolStatsSnapshot {
    /// Success rate as a percentage (0.0 - 100.0)
    pub fn success_rate(&self) -> f64 {
        if self.jobs_completed == 0 {
            100.0
        } else {
            let succeeded = self.jobs_completed - self.jobs_failed;
            (succeeded as f64 / self.jobs_completed as f64) * 100.0
        }
    }
}

/// Job submitted to the pool
enum Job {
    /// Run inline source after binding globals
    Execute {
        source: String,
        file: Option<String>,
        globals: Vec<(String, HostValue)>,
        response: oneshot::Sender<ExecResult>,
    },
    /// Load and run a script through the source provider
    ExecuteFile {
        path: String,
        response: oneshot::Sender<ExecResult>,
    },
    /// Call a function by name
    Call {
        function: String,
        args: Vec<HostValue>,
        response: oneshot::Sender<ExecResult>,
    },
    /// Shutdown signal
    Shutdown,
}

/// Builder for a [`WorkerPool`]
#[derive(Clone)]
pub struct WorkerPoolBuilder {
    pool_size: usize,
    queue_capacity: usize,
    engine: EngineBuilder,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().max(1),
            queue_capacity: 1024,
            engine: EngineBuilder::default(),
        }
    }
}

impl WorkerPoolBuilder {
    /// Number of worker threads. Default is the number of CPU cores.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Job queue capacity (backpressure threshold).
    ///
    /// When the queue is full, `try_execute` fails with `QueueFull`.
    /// Default is 1024.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Engine setup used by every worker
    pub fn engine(mut self, engine: EngineBuilder) -> Self {
        self.engine = engine;
        self
    }

    /// Start the worker threads
    pub fn build(self) -> EmberResult<WorkerPool> {
        // Surface configuration errors here instead of on every worker.
        self.engine.validate()?;

        let (job_tx, job_rx) = bounded::<Job>(self.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PoolStats::default());
        let mut workers = Vec::with_capacity(self.pool_size);

        for i in 0..self.pool_size {
            let rx = job_rx.clone();
            let engine = self.engine.clone();
            let worker_stats = stats.clone();

            let handle = std::thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || run_worker(rx, engine, worker_stats))?;
            workers.push(handle);
        }
        debug!(workers = workers.len(), capacity = self.queue_capacity, "worker pool started");

        Ok(WorkerPool {
            job_tx,
            workers,
            shutdown,
            stats,
        })
    }
}

/// Pool of engine threads
///
/// Use [`WorkerPool::handle`] to submit jobs.
pub struct WorkerPool {
    job_tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Start a pool with default configuration
    pub fn new() -> EmberResult<Self> {
        Self::builder().build()
    }

    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::default()
    }

    /// Thread-safe handle for submitting jobs
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            job_tx: self.job_tx.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    /// Number of worker threads
    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Finish queued jobs, then stop every worker and wait for it.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);

        for _ in &self.workers {
            let _ = self.job_tx.send(Job::Shutdown);
        }

        let workers = self.workers;
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                let _ = worker.join();
            }
        })
        .await
        .ok();
        debug!("worker pool stopped");
    }
}

/// Thread-safe handle for submitting jobs to a [`WorkerPool`]
#[derive(Clone)]
pub struct WorkerHandle {
    job_tx: Sender<Job>,
    stats: Arc<PoolStats>,
}

impl WorkerHandle {
    /// Run `source` in a fresh context on some worker.
    pub async fn execute(&self, source: impl Into<String>) -> ExecResult {
        self.submit(|response| Job::Execute {
            source: source.into(),
            file: None,
            globals: Vec::new(),
            response,
        })
        .await
    }

    /// Run `source` with globals bound first, reporting `file` in errors.
    pub async fn execute_with(
        &self,
        source: impl Into<String>,
        file: impl Into<String>,
        globals: Vec<(String, HostValue)>,
    ) -> ExecResult {
        self.submit(|response| Job::Execute {
            source: source.into(),
            file: Some(file.into()),
            globals,
            response,
        })
        .await
    }

    /// Run a script file resolved by the workers' source provider.
    pub async fn execute_file(&self, path: impl Into<String>) -> ExecResult {
        self.submit(|response| Job::ExecuteFile {
            path: path.into(),
            response,
        })
        .await
    }

    /// Call a function by name in a fresh context. Only functions that
    /// every context has (builtins, host functions, extension scripts) are
    /// reachable.
    pub async fn call(&self, function: impl Into<String>, args: Vec<HostValue>) -> ExecResult {
        self.submit(|response| Job::Call {
            function: function.into(),
            args,
            response,
        })
        .await
    }

    /// Submit without waiting for queue space. The returned receiver
    /// yields the result.
    pub fn try_execute(
        &self,
        source: impl Into<String>,
    ) -> EmberResult<oneshot::Receiver<ExecResult>> {
        let (tx, rx) = oneshot::channel();
        self.job_tx
            .try_send(Job::Execute {
                source: source.into(),
                file: None,
                globals: Vec::new(),
                response: tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => EmberError::QueueFull,
                TrySendError::Disconnected(_) => EmberError::PoolClosed("shut down"),
            })?;
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    async fn submit(&self, job: impl FnOnce(oneshot::Sender<ExecResult>) -> Job) -> ExecResult {
        let (tx, rx) = oneshot::channel();
        self.job_tx
            .send(job(tx))
            .map_err(|_| EmberError::PoolClosed("shut down"))?;
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);

        rx.await
            .map_err(|_| EmberError::PoolClosed("worker dropped response"))?
    }
}

/// Worker loop: one engine per thread, one fresh context per job.
fn run_worker(job_rx: Receiver<Job>, builder: EngineBuilder, stats: Arc<PoolStats>) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("ember-worker")
        .to_string();

    let _span = info_span!("worker", name = %thread_name).entered();
    debug!("Worker starting");

    let mut engine = match builder.clone().start() {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to start engine");
            return;
        }
    };

    while let Ok(job) = job_rx.recv() {
        if matches!(job, Job::Shutdown) {
            debug!("Received shutdown signal");
            break;
        }
        execute_job(&engine, job, &stats);

        if !engine.is_running() {
            warn!("Engine terminated by a fault, restarting");
            stats.engine_restarts.fetch_add(1, Ordering::Relaxed);
            engine = match builder.clone().start() {
                Ok(engine) => engine,
                Err(e) => {
                    error!(error = %e, "Failed to restart engine");
                    return;
                }
            };
        }
    }

    if let Err(e) = engine.shutdown() {
        warn!(error = %e, "Engine shutdown failed");
    }
    debug!("Worker stopped");
}

fn execute_job(engine: &Engine, job: Job, stats: &PoolStats) {
    match job {
        Job::Shutdown => {}
        Job::Execute {
            source,
            file,
            globals,
            response,
        } => {
            let file = file.unwrap_or_else(|| "main.php".to_string());
            let _span = info_span!("execute", file = %file).entered();
            let result = execute_with_panic_handler(|| {
                let ctx = engine.new_context()?;
                for (name, value) in globals {
                    ctx.bind_global(&name, value)?;
                }
                ctx.execute_named(&source, &file)
            });
            update_stats(stats, &result);
            let _ = response.send(result);
        }
        Job::ExecuteFile { path, response } => {
            let _span = info_span!("execute_file", path = %path).entered();
            let result = execute_with_panic_handler(|| engine.new_context()?.execute_file(&path));
            update_stats(stats, &result);
            let _ = response.send(result);
        }
        Job::Call {
            function,
            args,
            response,
        } => {
            let _span = info_span!("call", function = %function).entered();
            let result =
                execute_with_panic_handler(|| engine.new_context()?.call_function(&function, &args));
            update_stats(stats, &result);
            let _ = response.send(result);
        }
    }
}

/// Run a job, turning a panic into an error. The job's context is dropped
/// inside the closure, which closes it either way.
fn execute_with_panic_handler<F>(f: F) -> ExecResult
where
    F: FnOnce() -> ExecResult,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown error".to_string()
            };
            error!(message = %message, "Worker panic");
            Err(ScriptFailure::from(EmberError::WorkerPanic(message)))
        }
    }
}

fn update_stats(stats: &PoolStats, result: &ExecResult) {
    stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
    if result.is_err() {
        stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }
}
