//! The master: keeps one worker process per consumer group alive.
//!
//! Each pass of the loop reconciles the registry against the configuration,
//! reaps exited children, spawns what is missing and then handles at most one
//! queued signal, sleeping on the router's wakeup pipe when there is none.
//! Reload and stop share one escalation routine: SIGTERM and reap every
//! 100ms until the workers are gone or the deadline passes, then SIGKILL.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::time::Instant;

use crate::config::{Configuration, ConfigurationFactory, DeferredConfig};
use crate::error::Result;
use crate::registry::WorkerRegistry;
use crate::signals::{Action, SignalRouter, DEFAULT_MAX_SIGNAL_QUEUE};
use crate::worker::Launcher;

/// Longest the loop sleeps when no signal is pending.
pub const WAKEUP_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval of the stop/reload escalation loop.
pub const ESCALATION_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
	pub max_fail_count: u32,
	pub stop_timeout: Duration,
	pub reload_timeout: Duration,
	pub max_signal_queue: usize,
}

impl Default for Thresholds {
	fn default() -> Self {
		Self {
			max_fail_count: 3,
			stop_timeout: Duration::from_secs(10),
			reload_timeout: Duration::from_secs(10),
			max_signal_queue: DEFAULT_MAX_SIGNAL_QUEUE,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
	Running,
	Reloading,
	Stopping,
	Terminated,
}

/// Result of one stop/reload escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
	/// Workers still alive at the deadline that were sent SIGKILL.
	pub killed: usize,
	pub elapsed: Duration,
}

pub struct Master<F: ConfigurationFactory, L: Launcher> {
	config: DeferredConfig<F>,
	launcher: L,
	router: Arc<SignalRouter>,
	registry: WorkerRegistry,
	thresholds: Thresholds,
	state: MasterState,
}

impl<F: ConfigurationFactory, L: Launcher> Master<F, L> {
	pub fn new(factory: F, launcher: L, router: Arc<SignalRouter>, thresholds: Thresholds) -> Self {
		Self {
			config: DeferredConfig::new(factory),
			launcher,
			router,
			registry: WorkerRegistry::new(),
			thresholds,
			state: MasterState::Running,
		}
	}

	pub fn state(&self) -> MasterState {
		self.state
	}

	pub fn registry(&self) -> &WorkerRegistry {
		&self.registry
	}

	pub fn thresholds(&self) -> &Thresholds {
		&self.thresholds
	}

	pub fn launcher(&self) -> &L {
		&self.launcher
	}

	/// How many configuration instances have been built so far.
	pub fn config_generation(&self) -> u64 {
		self.config.generation()
	}

	/// Current configuration, built on first access.
	pub fn configuration(&mut self) -> Result<Arc<F::Config>> {
		self.config.get()
	}

	/// One reconcile, reap, spawn pass.
	pub fn tick(&mut self) -> Result<()> {
		let desired = self.config.get()?.consumer_groups();
		let max = self.thresholds.max_fail_count;

		let report = self.registry.reconcile(&desired, &mut self.launcher, max);
		if !report.is_noop() {
			tracing::debug!(
				added = report.added.len(),
				dropped = report.dropped.len(),
				signalled = report.signalled.len(),
				"reconciled workers"
			);
		}
		self.registry.reap(&mut self.launcher, max)?;
		self.registry.spawn_missing(&desired, &mut self.launcher, max);
		Ok(())
	}

	/// Supervise until a terminate signal or an error.
	///
	/// Workers are always stopped before this returns. An error from the loop
	/// is logged and returned after the stop completes.
	pub async fn run(&mut self) -> Result<()> {
		self.state = MasterState::Running;
		tracing::info!(pid = %nix::unistd::getpid(), "master started");

		let result = self.supervise().await;
		if let Err(e) = &result {
			tracing::error!("supervisor loop failed: {}", e);
		}
		self.stop().await;
		result
	}

	async fn supervise(&mut self) -> Result<()> {
		loop {
			self.tick()?;

			let Some(sig) = self.router.pop() else {
				self.router.wait(WAKEUP_INTERVAL).await?;
				continue;
			};

			match self.router.action_for(sig) {
				Some(Action::Reload) => {
					self.reload().await;
				}
				Some(Action::Terminate) => {
					tracing::info!(signal = ?sig, "terminate requested");
					return Ok(());
				}
				None => tracing::info!(signal = ?sig, "ignoring unhandled signal"),
			}
		}
	}

	/// Stop every worker, forget past failures and rebuild the configuration.
	///
	/// Workers are respawned by the next tick under the new configuration.
	pub async fn reload(&mut self) -> Drained {
		self.state = MasterState::Reloading;
		tracing::info!(running = self.registry.running(), "reloading");

		let drained = self.drain(self.thresholds.reload_timeout).await;
		self.registry.reset_failures();
		self.config.reset();

		tracing::info!(elapsed = ?drained.elapsed, killed = drained.killed, "reload complete");
		self.state = MasterState::Running;
		drained
	}

	/// Terminal shutdown of all workers.
	pub async fn stop(&mut self) -> Drained {
		self.state = MasterState::Stopping;
		tracing::info!(running = self.registry.running(), "stopping workers");

		let drained = self.drain(self.thresholds.stop_timeout).await;

		tracing::info!(elapsed = ?drained.elapsed, killed = drained.killed, "master stopped");
		self.state = MasterState::Terminated;
		drained
	}

	async fn drain(&mut self, timeout: Duration) -> Drained {
		let started = Instant::now();
		let deadline = started + timeout;
		let max = self.thresholds.max_fail_count;

		loop {
			if let Err(e) = self.registry.reap(&mut self.launcher, max) {
				tracing::warn!("reap failed while stopping workers: {}", e);
			}
			if self.registry.running() == 0 {
				return Drained {
					killed: 0,
					elapsed: started.elapsed(),
				};
			}

			let now = Instant::now();
			if now >= deadline {
				let killed = self.registry.signal_running(&mut self.launcher, Signal::SIGKILL);
				tracing::warn!(killed, ?timeout, "workers did not stop in time, killed");
				return Drained {
					killed,
					elapsed: started.elapsed(),
				};
			}

			self.registry.signal_running(&mut self.launcher, Signal::SIGTERM);
			tokio::time::sleep(ESCALATION_POLL.min(deadline - now)).await;
		}
	}
}
