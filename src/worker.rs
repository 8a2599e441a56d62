//! Worker lifecycle
//!
//! Every long-running component implements [`Worker`] and is driven by the
//! [`Supervisor`]: each enabled worker runs as its own task, cancellation
//! fans out through one shared [`Shutdown`] handle, and cleanup runs for
//! every worker exactly once regardless of individual failures.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// One-shot cooperative cancellation signal shared by all workers.
///
/// The flag transitions from running to cancelled once and never back.
/// Blocking loops poll [`Shutdown::is_cancelled`] each iteration; async
/// loops additionally await [`Shutdown::cancelled`].
#[derive(Clone, Default)]
pub struct Shutdown {
  flag: Arc<AtomicBool>,
  notify: Arc<Notify>,
}

impl Shutdown {
  pub fn new() -> Self {
    Self::default()
  }

  /// Non-blocking check, safe from any thread.
  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Relaxed)
  }

  /// Set the signal. Idempotent; later calls are no-ops.
  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Relaxed);
    self.notify.notify_waiters();
  }

  /// Resolve once the signal is set. Returns immediately if it already is.
  pub async fn cancelled(&self) {
    loop {
      // Register for the wakeup before re-checking the flag, otherwise a
      // cancel between the check and the await is lost.
      let notified = self.notify.notified();
      if self.is_cancelled() {
        return;
      }
      notified.await;
    }
  }
}

/// A unit of long-running work with a uniform start/stop/cleanup contract.
#[async_trait]
pub trait Worker: Send + Sync {
  /// Short name used in log output.
  fn name(&self) -> &'static str;

  /// Whether this worker should be started at all. A concrete worker may
  /// opt out based on configuration.
  fn enabled(&self) -> bool {
    true
  }

  /// The main loop. Must poll `shutdown` at every blocking iteration and
  /// return promptly once it is set. An `Err` return is worker-fatal: the
  /// supervisor logs it and shuts the remaining workers down.
  async fn run(&self, shutdown: Shutdown) -> Result<()>;

  /// Idempotent resource release, invoked once on shutdown. Errors are
  /// logged by the supervisor and never propagated.
  async fn cleanup(&self) -> Result<()> {
    Ok(())
  }
}

/// Starts the enabled workers and coordinates their shutdown.
pub struct Supervisor {
  workers: Vec<Arc<dyn Worker>>,
  shutdown: Shutdown,
  stopped: AtomicBool,
}

impl Supervisor {
  pub fn new(workers: Vec<Arc<dyn Worker>>) -> Self {
    Self {
      workers,
      shutdown: Shutdown::new(),
      stopped: AtomicBool::new(false),
    }
  }

  /// The shared cancellation handle, for callers that need to trigger a
  /// stop from outside (e.g. a signal handler).
  pub fn shutdown_handle(&self) -> Shutdown {
    self.shutdown.clone()
  }

  /// Run every enabled worker until the first one finishes, then stop the
  /// rest. One worker's exit, fatal or not, ends the session.
  pub async fn run(&self) -> Result<()> {
    let mut tasks = JoinSet::new();

    for worker in &self.workers {
      if !worker.enabled() {
        tracing::info!("{} is disabled, not starting", worker.name());
        continue;
      }
      let worker = worker.clone();
      let shutdown = self.shutdown.clone();
      tasks.spawn(async move {
        let name = worker.name();
        tracing::info!("starting {}", name);
        if let Err(e) = worker.run(shutdown).await {
          tracing::error!("{} exited with error: {}", name, e);
        } else {
          tracing::info!("{} finished", name);
        }
      });
    }

    if tasks.is_empty() {
      tracing::warn!("no workers enabled, nothing to do");
      return Ok(());
    }

    tokio::select! {
      _ = tasks.join_next() => {}
      _ = tokio::signal::ctrl_c() => {
        tracing::info!("interrupt received");
      }
      _ = self.shutdown.cancelled() => {}
    }

    self.stop().await;

    // Give the remaining loops a chance to observe the signal and return.
    while tasks.join_next().await.is_some() {}
    Ok(())
  }

  /// Cancel the shared signal and run every worker's cleanup. Guarded so
  /// cleanup happens exactly once even under concurrent shutdown requests;
  /// one worker's cleanup failure never blocks the others.
  pub async fn stop(&self) {
    if self.stopped.swap(true, Ordering::SeqCst) {
      return;
    }
    self.shutdown.cancel();

    for worker in &self.workers {
      if let Err(e) = worker.cleanup().await {
        tracing::error!("{} cleanup failed: {}", worker.name(), e);
      }
    }
  }
}
