//! # arbiter
//!
//! Master/worker process supervision for long-running daemons.
//!
//! A [`Master`] keeps one worker process per consumer group alive: it
//! reconciles the groups a configuration yields against running processes,
//! reaps and counts failures, reloads on SIGHUP and stops everyone within a
//! deadline on SIGTERM. Each worker runs a [`SingleProcessMonitor`] scoped to
//! its group, guarded by a [`ParentWatchdog`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use arbiter::{CommandLauncher, Configuration, Master, SignalRouter, Thresholds};
//!
//! struct Groups(BTreeSet<String>);
//!
//! impl Configuration for Groups {
//!     fn consumer_groups(&self) -> BTreeSet<String> {
//!         self.0.clone()
//!     }
//!     fn filter_consumers(&mut self, groups: &BTreeSet<String>) {
//!         self.0.retain(|g| groups.contains(g));
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> arbiter::Result<()> {
//! let thresholds = Thresholds::default();
//! let router = SignalRouter::new(thresholds.max_signal_queue)?;
//! router.install()?;
//!
//! let launcher = CommandLauncher::new("/usr/local/bin/myworker").args(["--group", "{group}"]);
//! let factory = || -> arbiter::Result<Groups> {
//!     Ok(Groups(["a".to_string(), "b".to_string()].into()))
//! };
//!
//! let mut master = Master::new(factory, launcher, router, thresholds);
//! master.run().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod master;
pub mod monitor;
pub mod registry;
pub mod signals;
pub mod title;
pub mod watchdog;
pub mod worker;

pub use config::{Configuration, ConfigurationFactory, DeferredConfig, GroupId};
pub use error::{Result, SupervisorError};
pub use master::{Drained, Master, MasterState, Thresholds};
pub use monitor::{Control, ControlToken, SingleProcessMonitor, WorkBody};
pub use registry::{Reconciliation, WorkerRegistry};
pub use signals::{Action, SignalRouter};
pub use watchdog::ParentWatchdog;
pub use worker::{CommandLauncher, ExitKind, Launcher, Reaped, Worker};

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
