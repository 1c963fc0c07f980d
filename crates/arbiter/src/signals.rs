//! Signal routing through a self-pipe.
//!
//! OS signals are turned into an ordered, bounded queue of pending signals plus
//! one byte written to a nonblocking pipe. The main loop blocks on the read end
//! of that pipe with a timeout, so a signal arriving during the wait wakes it
//! immediately while the handling itself happens synchronously, in order.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::Signal;
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::error::Result;

pub const DEFAULT_MAX_SIGNAL_QUEUE: usize = 5;

/// Exit status used when the user interrupts the process.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// What a queued signal asks the owner of the router to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
	Reload,
	Terminate,
}

/// HUP reloads, TERM terminates; USR1/USR2 are queued but have no action.
pub fn default_table() -> Vec<(Signal, Option<Action>)> {
	vec![
		(Signal::SIGHUP, Some(Action::Reload)),
		(Signal::SIGTERM, Some(Action::Terminate)),
		(Signal::SIGUSR1, None),
		(Signal::SIGUSR2, None),
	]
}

pub struct SignalRouter {
	queue: Mutex<VecDeque<Signal>>,
	max_queue: usize,
	actions: HashMap<Signal, Action>,
	listened: Vec<Signal>,
	wake_read: AsyncFd<OwnedFd>,
	wake_write: OwnedFd,
}

impl SignalRouter {
	/// Router with the default signal table. Must be called inside a tokio runtime.
	pub fn new(max_queue: usize) -> Result<Arc<Self>> {
		Self::with_table(max_queue, default_table())
	}

	pub fn with_table(max_queue: usize, table: Vec<(Signal, Option<Action>)>) -> Result<Arc<Self>> {
		let (read, write) = nix::unistd::pipe()?;
		prepare_pipe_end(&read)?;
		prepare_pipe_end(&write)?;

		let mut actions = HashMap::new();
		let mut listened = Vec::new();
		for (sig, action) in table {
			if let Some(action) = action {
				actions.insert(sig, action);
			}
			listened.push(sig);
		}

		Ok(Arc::new(Self {
			queue: Mutex::new(VecDeque::with_capacity(max_queue)),
			max_queue,
			actions,
			listened,
			wake_read: AsyncFd::new(read)?,
			wake_write: write,
		}))
	}

	/// Hook the table's signals (and SIGINT) up to this router.
	///
	/// Each signal gets a forwarding task that lives for the rest of the
	/// process. SIGINT exits the process immediately.
	pub fn install(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
		let mut handles = Vec::with_capacity(self.listened.len() + 1);

		for &sig in &self.listened {
			let mut stream = signal(SignalKind::from_raw(sig as i32))?;
			let router = Arc::clone(self);
			handles.push(tokio::spawn(async move {
				while stream.recv().await.is_some() {
					if let Err(e) = router.deliver(sig) {
						tracing::error!(signal = ?sig, "failed to queue signal: {}", e);
					}
				}
			}));
		}

		let mut interrupt = signal(SignalKind::interrupt())?;
		handles.push(tokio::spawn(async move {
			if interrupt.recv().await.is_some() {
				tracing::info!("interrupted, exiting");
				std::process::exit(INTERRUPT_EXIT_CODE);
			}
		}));

		Ok(handles)
	}

	/// Queue `sig` and wake any waiter.
	///
	/// Returns `Ok(false)` when the queue is full and the signal was dropped.
	pub fn deliver(&self, sig: Signal) -> Result<bool> {
		{
			let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
			if queue.len() >= self.max_queue {
				tracing::warn!(
					signal = ?sig,
					queued = queue.len(),
					max = self.max_queue,
					"signal queue full, dropping signal"
				);
				return Ok(false);
			}
			queue.push_back(sig);
		}
		self.wake()?;
		Ok(true)
	}

	/// Oldest pending signal, if any.
	pub fn pop(&self) -> Option<Signal> {
		self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
	}

	pub fn pending(&self) -> usize {
		self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn max_queue(&self) -> usize {
		self.max_queue
	}

	/// The action mapped to `sig`, or `None` if the signal is unhandled.
	pub fn action_for(&self, sig: Signal) -> Option<Action> {
		self.actions.get(&sig).copied()
	}

	/// Block until woken by a delivered signal or until `timeout` elapses.
	///
	/// Returns `true` when woken early. Pending wakeup bytes are drained.
	pub async fn wait(&self, timeout: Duration) -> Result<bool> {
		match tokio::time::timeout(timeout, self.woken()).await {
			Ok(res) => res.map(|_| true),
			Err(_) => Ok(false),
		}
	}

	/// Wait for the next queued signal and pop it.
	pub async fn next(&self) -> Result<Signal> {
		loop {
			if let Some(sig) = self.pop() {
				return Ok(sig);
			}
			self.woken().await?;
		}
	}

	async fn woken(&self) -> Result<()> {
		loop {
			let mut guard = self.wake_read.readable().await?;
			match guard.try_io(|fd| drain(fd.get_ref())) {
				Ok(res) => return res.map(|_| ()).map_err(Into::into),
				Err(_would_block) => continue,
			}
		}
	}

	fn wake(&self) -> Result<()> {
		match nix::unistd::write(&self.wake_write, &[1u8]) {
			// EAGAIN: the pipe is full, a wakeup is already pending.
			Ok(_) | Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

fn prepare_pipe_end(fd: &OwnedFd) -> Result<()> {
	let raw = fd.as_raw_fd();
	let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
	fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
	fcntl(raw, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
	Ok(())
}

/// Read everything currently in the pipe.
///
/// `WouldBlock` is only reported when nothing at all could be read, so the
/// caller's readiness is cleared exactly when the pipe was already empty.
fn drain(fd: &OwnedFd) -> io::Result<usize> {
	let mut buf = [0u8; 64];
	let mut total = 0;
	loop {
		match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
			Ok(0) => return Ok(total),
			Ok(n) => total += n,
			Err(Errno::EINTR) => continue,
			Err(Errno::EAGAIN) if total == 0 => return Err(io::ErrorKind::WouldBlock.into()),
			Err(Errno::EAGAIN) => return Ok(total),
			Err(e) => return Err(e.into()),
		}
	}
}
