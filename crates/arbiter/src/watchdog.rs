//! Parent-liveness watchdog.
//!
//! A worker remembers its parent pid at startup. If the parent changes, the
//! master died without stopping us and we were re-parented: the worker sends
//! itself SIGTERM so it shuts down through its normal terminate path.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, getppid, Pid};
use tokio::task::JoinHandle;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct ParentWatchdog {
	original: Pid,
	interval: Duration,
}

impl ParentWatchdog {
	/// Watch the current parent.
	pub fn new(interval: Duration) -> Self {
		Self::with_parent(getppid(), interval)
	}

	pub fn with_parent(original: Pid, interval: Duration) -> Self {
		Self { original, interval }
	}

	pub fn original_parent(&self) -> Pid {
		self.original
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	/// Poll `getppid` and SIGTERM ourselves on a mismatch.
	pub fn spawn(self) -> JoinHandle<()> {
		self.spawn_with(getppid, |_| terminate_self())
	}

	/// Poll `probe` every interval; call `on_orphaned` once on the first
	/// mismatch and stop.
	pub fn spawn_with<P, A>(self, probe: P, on_orphaned: A) -> JoinHandle<()>
	where
		P: Fn() -> Pid + Send + 'static,
		A: FnOnce(Pid) + Send + 'static,
	{
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let current = probe();
				if current != self.original {
					tracing::warn!(
						original = %self.original,
						current = %current,
						"parent process changed, terminating worker"
					);
					on_orphaned(current);
					return;
				}
			}
		})
	}
}

fn terminate_self() {
	if let Err(e) = kill(getpid(), Signal::SIGTERM) {
		tracing::error!("failed to signal self: {}", e);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
	use std::sync::Arc;

	#[tokio::test]
	async fn fires_once_when_parent_changes() {
		let parent = Arc::new(AtomicI32::new(100));
		let fired = Arc::new(AtomicU32::new(0));
		let (tx, rx) = tokio::sync::oneshot::channel();

		let probe_parent = Arc::clone(&parent);
		let fired_count = Arc::clone(&fired);
		let handle = ParentWatchdog::with_parent(Pid::from_raw(100), Duration::from_millis(10))
			.spawn_with(
				move || Pid::from_raw(probe_parent.load(Ordering::SeqCst)),
				move |current| {
					fired_count.fetch_add(1, Ordering::SeqCst);
					let _ = tx.send(current);
				},
			);

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(fired.load(Ordering::SeqCst), 0);

		parent.store(1, Ordering::SeqCst);
		let current = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
		assert_eq!(current, Pid::from_raw(1));

		// The task stops polling after firing.
		tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn new_captures_current_parent() {
		let dog = ParentWatchdog::new(DEFAULT_WATCHDOG_INTERVAL);
		assert_eq!(dog.original_parent(), getppid());
		assert_eq!(dog.interval(), Duration::from_secs(1));
	}
}
