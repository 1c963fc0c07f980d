//! Foreground, non-forking supervision of a [`WorkBody`].
//!
//! Used directly for in-process operation and as the body of every spawned
//! worker. Reload and terminate arrive through the [`SignalRouter`]; either
//! one interrupts the running body. The body first sees the request on its
//! [`ControlToken`] and gets a short grace period to return on its own before
//! its future is dropped.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::{Configuration, ConfigurationFactory, DeferredConfig, GroupId};
use crate::error::Result;
use crate::signals::{Action, SignalRouter};
use crate::watchdog::ParentWatchdog;

/// How long an interrupted body may take to return before it is dropped.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
	Run,
	Reload,
	Terminate,
}

/// Read side of the monitor's control channel, handed to the body.
#[derive(Debug, Clone)]
pub struct ControlToken {
	rx: watch::Receiver<Control>,
}

impl ControlToken {
	pub fn current(&self) -> Control {
		*self.rx.borrow()
	}

	/// True once the monitor asked the body to return.
	pub fn is_interrupted(&self) -> bool {
		self.current() != Control::Run
	}

	/// Resolve once the monitor asks the body to return.
	pub async fn interrupted(&mut self) -> Control {
		loop {
			let current = *self.rx.borrow_and_update();
			if current != Control::Run {
				return current;
			}
			if self.rx.changed().await.is_err() {
				// Monitor is gone; nobody will ever let us run on.
				return Control::Terminate;
			}
		}
	}
}

/// The long-running monitoring work.
///
/// Implementations must stay responsive to cancellation: they run on the
/// async runtime and are dropped at an await point if they do not return
/// within the grace period after `control` is interrupted.
pub trait WorkBody<C: Configuration>: Send + Sync {
	fn run_monitor(
		&self,
		paths: &[PathBuf],
		config: Arc<C>,
		control: ControlToken,
	) -> impl Future<Output = Result<()>> + Send;
}

impl<C, F, Fut> WorkBody<C> for F
where
	C: Configuration,
	F: Fn(Vec<PathBuf>, Arc<C>, ControlToken) -> Fut + Send + Sync,
	Fut: Future<Output = Result<()>> + Send,
{
	fn run_monitor(
		&self,
		paths: &[PathBuf],
		config: Arc<C>,
		control: ControlToken,
	) -> impl Future<Output = Result<()>> + Send {
		self(paths.to_vec(), config, control)
	}
}

enum Outcome {
	Finished(Result<()>),
	Reload,
	Terminate,
}

pub struct SingleProcessMonitor<F: ConfigurationFactory, B> {
	config: DeferredConfig<F>,
	body: B,
	paths: Vec<PathBuf>,
	router: Arc<SignalRouter>,
	grace: Duration,
	watchdog: Option<ParentWatchdog>,
}

impl<F, B> SingleProcessMonitor<F, B>
where
	F: ConfigurationFactory,
	B: WorkBody<F::Config>,
{
	/// Monitor every consumer group the configuration yields.
	pub fn new(factory: F, body: B, paths: Vec<PathBuf>, router: Arc<SignalRouter>) -> Self {
		Self::with_config(DeferredConfig::new(factory), body, paths, router)
	}

	/// Monitor a single consumer group, as a worker does.
	pub fn for_group(
		factory: F,
		group: impl Into<GroupId>,
		body: B,
		paths: Vec<PathBuf>,
		router: Arc<SignalRouter>,
	) -> Self {
		let groups = BTreeSet::from([group.into()]);
		Self::with_config(DeferredConfig::restricted(factory, groups), body, paths, router)
	}

	pub fn with_config(
		config: DeferredConfig<F>,
		body: B,
		paths: Vec<PathBuf>,
		router: Arc<SignalRouter>,
	) -> Self {
		Self {
			config,
			body,
			paths,
			router,
			grace: DEFAULT_GRACE,
			watchdog: None,
		}
	}

	pub fn grace(mut self, grace: Duration) -> Self {
		self.grace = grace;
		self
	}

	/// Run a parent-liveness watchdog alongside the body.
	pub fn watchdog(mut self, watchdog: ParentWatchdog) -> Self {
		self.watchdog = Some(watchdog);
		self
	}

	pub fn config_generation(&self) -> u64 {
		self.config.generation()
	}

	/// Run the body until terminated, restarting it on every reload.
	///
	/// Returns `Ok` on terminate or when the body finishes by itself, and the
	/// body's error if it fails.
	pub async fn run(&mut self) -> Result<()> {
		let watchdog = self.watchdog.map(ParentWatchdog::spawn);
		let result = self.supervise().await;
		if let Some(handle) = watchdog {
			handle.abort();
		}
		result
	}

	async fn supervise(&mut self) -> Result<()> {
		loop {
			let config = self.config.get()?;
			match self.run_once(config).await? {
				Outcome::Finished(Ok(())) => {
					tracing::info!("monitor finished");
					return Ok(());
				}
				Outcome::Finished(Err(e)) => {
					tracing::error!("monitor failed: {}", e);
					return Err(e);
				}
				Outcome::Reload => {
					tracing::info!("reloading configuration");
					self.config.reset();
				}
				Outcome::Terminate => {
					tracing::info!("monitor terminated");
					return Ok(());
				}
			}
		}
	}

	async fn run_once(&self, config: Arc<F::Config>) -> Result<Outcome> {
		let (tx, rx) = watch::channel(Control::Run);
		let body = self.body.run_monitor(&self.paths, config, ControlToken { rx });
		tokio::pin!(body);

		let control = loop {
			tokio::select! {
				res = &mut body => return Ok(Outcome::Finished(res)),
				sig = self.router.next() => {
					let sig = sig?;
					match self.router.action_for(sig) {
						Some(Action::Reload) => break Control::Reload,
						Some(Action::Terminate) => break Control::Terminate,
						None => tracing::info!(signal = ?sig, "ignoring unhandled signal"),
					}
				}
			}
		};

		tx.send_replace(control);
		match tokio::time::timeout(self.grace, &mut body).await {
			Ok(Err(e)) => tracing::warn!(?control, "monitor returned an error while interrupted: {}", e),
			Ok(Ok(())) => {}
			Err(_) => tracing::debug!(?control, "monitor did not return within grace, dropping it"),
		}

		Ok(match control {
			Control::Reload => Outcome::Reload,
			_ => Outcome::Terminate,
		})
	}
}
