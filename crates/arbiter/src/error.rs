use std::fmt;
use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

/// Errors surfaced by the arbiter.
#[derive(Debug)]
pub enum SupervisorError {
	/// IO error on the wakeup pipe or while launching a process.
	Io(io::Error),
	/// A system call failed with an errno other than the transient ones.
	Os(Errno),
	/// `kill` found no such process (ESRCH). Callers treat this as "already terminated".
	ProcessGone { pid: Pid },
	/// A worker process could not be started.
	Spawn { group: String, reason: String },
	/// The configuration provider could not build or load a configuration.
	Config(String),
	/// The monitoring body failed.
	Monitor(String),
}

impl fmt::Display for SupervisorError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SupervisorError::Io(e) => write!(f, "io error: {}", e),
			SupervisorError::Os(e) => write!(f, "os error: {}", e),
			SupervisorError::ProcessGone { pid } => write!(f, "process {} no longer exists", pid),
			SupervisorError::Spawn { group, reason } => {
				write!(f, "failed to spawn worker for {}: {}", group, reason)
			}
			SupervisorError::Config(e) => write!(f, "configuration error: {}", e),
			SupervisorError::Monitor(e) => write!(f, "monitor error: {}", e),
		}
	}
}

impl std::error::Error for SupervisorError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			SupervisorError::Io(e) => Some(e),
			SupervisorError::Os(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SupervisorError {
	fn from(e: io::Error) -> Self {
		SupervisorError::Io(e)
	}
}

impl From<Errno> for SupervisorError {
	fn from(e: Errno) -> Self {
		SupervisorError::Os(e)
	}
}

impl SupervisorError {
	pub fn is_process_gone(&self) -> bool {
		matches!(self, SupervisorError::ProcessGone { .. })
	}
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
