use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::GroupId;
use crate::error::{Result, SupervisorError};

/// Replaced by the worker's group in every launcher argument.
pub const GROUP_PLACEHOLDER: &str = "{group}";

/// Environment variable carrying the assigned group into the worker.
pub const GROUP_ENV: &str = "ARBITER_GROUP";

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
	Code(i32),
	Signaled(Signal),
}

impl ExitKind {
	pub fn is_success(&self) -> bool {
		matches!(self, ExitKind::Code(0))
	}
}

impl fmt::Display for ExitKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExitKind::Code(code) => write!(f, "exit {}", code),
			ExitKind::Signaled(sig) => write!(f, "killed by {:?}", sig),
		}
	}
}

/// A child process collected by [`Launcher::reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
	pub pid: Pid,
	pub exit: ExitKind,
}

impl Reaped {
	pub fn from_status(status: WaitStatus) -> Option<Self> {
		match status {
			WaitStatus::Exited(pid, code) => Some(Reaped { pid, exit: ExitKind::Code(code) }),
			WaitStatus::Signaled(pid, sig, _) => Some(Reaped { pid, exit: ExitKind::Signaled(sig) }),
			_ => None,
		}
	}
}

/// Process operations the master needs.
pub trait Launcher {
	/// Start a new process serving exactly `group`.
	fn spawn(&mut self, group: &str) -> Result<Pid>;

	fn kill(&mut self, pid: Pid, sig: Signal) -> nix::Result<()>;

	/// Collect one exited child without blocking.
	fn reap(&mut self) -> Result<Option<Reaped>>;
}

/// Launches a fresh process image per group.
///
/// Every argument has [`GROUP_PLACEHOLDER`] replaced by the group and the
/// child gets [`GROUP_ENV`] set, so the worker builds its own configuration
/// instead of inheriting one.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
	program: PathBuf,
	args: Vec<String>,
	envs: Vec<(String, String)>,
}

impl CommandLauncher {
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			envs: Vec::new(),
		}
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.envs.push((key.into(), value.into()));
		self
	}

	pub fn program(&self) -> &PathBuf {
		&self.program
	}

	/// Arguments as they will be passed for `group`.
	pub fn args_for(&self, group: &str) -> Vec<String> {
		self.args
			.iter()
			.map(|a| a.replace(GROUP_PLACEHOLDER, group))
			.collect()
	}

	fn command_for(&self, group: &str) -> Command {
		let mut cmd = Command::new(&self.program);
		cmd.args(self.args_for(group))
			.env(GROUP_ENV, group)
			.stdin(Stdio::null());
		for (key, val) in &self.envs {
			cmd.env(key, val);
		}
		cmd
	}
}

impl Launcher for CommandLauncher {
	fn spawn(&mut self, group: &str) -> Result<Pid> {
		// Dropping the Child neither waits nor kills; reaping happens in `reap`.
		let child = self
			.command_for(group)
			.spawn()
			.map_err(|e| SupervisorError::Spawn {
				group: group.to_string(),
				reason: e.to_string(),
			})?;
		Ok(Pid::from_raw(child.id() as i32))
	}

	fn kill(&mut self, pid: Pid, sig: Signal) -> nix::Result<()> {
		signal::kill(pid, sig)
	}

	fn reap(&mut self) -> Result<Option<Reaped>> {
		match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
			Ok(status) => Ok(Reaped::from_status(status)),
			Err(Errno::ECHILD) | Err(Errno::EINTR) => Ok(None),
			Err(e) => Err(e.into()),
		}
	}
}

/// One consumer group's worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
	name: GroupId,
	pid: Option<Pid>,
	fail_count: u32,
	/// A signal has been sent to the current process through [`Worker::kill`].
	stopping: bool,
}

impl Worker {
	pub fn new(name: impl Into<GroupId>) -> Self {
		Self {
			name: name.into(),
			pid: None,
			fail_count: 0,
			stopping: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn pid(&self) -> Option<Pid> {
		self.pid
	}

	pub fn fail_count(&self) -> u32 {
		self.fail_count
	}

	pub fn is_running(&self) -> bool {
		self.pid.is_some()
	}

	/// Whether the worker has failed often enough to stop being respawned.
	pub fn is_exhausted(&self, max_fail_count: u32) -> bool {
		self.fail_count >= max_fail_count
	}

	/// SIGTERM normally, SIGKILL straight away once the worker is exhausted.
	pub fn escalation_signal(&self, max_fail_count: u32) -> Signal {
		if self.is_exhausted(max_fail_count) {
			Signal::SIGKILL
		} else {
			Signal::SIGTERM
		}
	}

	/// Whether the current process has been asked to stop.
	pub fn is_stopping(&self) -> bool {
		self.stopping
	}

	pub(crate) fn started(&mut self, pid: Pid) {
		self.pid = Some(pid);
		self.stopping = false;
	}

	/// Record the process exit. Returns `true` when it counted as a failure.
	///
	/// Non-zero exits are failures. A signal death is a failure only if we
	/// never signalled the process ourselves.
	pub(crate) fn exited(&mut self, exit: ExitKind) -> bool {
		let requested = self.stopping;
		self.pid = None;
		self.stopping = false;
		match exit {
			ExitKind::Code(0) => false,
			ExitKind::Signaled(_) if requested => false,
			_ => {
				self.fail_count += 1;
				true
			}
		}
	}

	pub(crate) fn record_failure(&mut self) {
		self.fail_count += 1;
	}

	pub(crate) fn reset_failures(&mut self) {
		self.fail_count = 0;
	}

	/// Send `sig` to the worker's process.
	///
	/// A missing process (ESRCH) clears the pid and is still reported as
	/// [`SupervisorError::ProcessGone`]; callers treat it as "killed".
	pub fn kill<L: Launcher + ?Sized>(&mut self, launcher: &mut L, sig: Signal) -> Result<()> {
		let Some(pid) = self.pid else {
			return Ok(());
		};
		match launcher.kill(pid, sig) {
			Ok(()) => {
				self.stopping = true;
				Ok(())
			}
			Err(Errno::ESRCH) => {
				self.pid = None;
				self.stopping = false;
				Err(SupervisorError::ProcessGone { pid })
			}
			Err(e) => Err(e.into()),
		}
	}
}
