use std::collections::{BTreeSet, HashMap};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::GroupId;
use crate::error::{Result, SupervisorError};
use crate::worker::{Launcher, Reaped, Worker};

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
	pub added: Vec<GroupId>,
	pub dropped: Vec<GroupId>,
	pub signalled: Vec<(GroupId, Signal)>,
}

impl Reconciliation {
	pub fn is_noop(&self) -> bool {
		self.added.is_empty() && self.dropped.is_empty() && self.signalled.is_empty()
	}
}

/// Consumer group name to worker slot.
///
/// Keys always cover the last desired set; obsolete entries stay until their
/// process is gone.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
	workers: HashMap<GroupId, Worker>,
}

impl WorkerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, name: &str) -> Option<&Worker> {
		self.workers.get(name)
	}

	pub fn workers(&self) -> impl Iterator<Item = &Worker> {
		self.workers.values()
	}

	pub fn len(&self) -> usize {
		self.workers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.workers.is_empty()
	}

	pub fn running(&self) -> usize {
		self.workers.values().filter(|w| w.is_running()).count()
	}

	/// Add missing groups, drop obsolete idle ones, signal obsolete running ones.
	pub fn reconcile<L: Launcher + ?Sized>(
		&mut self,
		desired: &BTreeSet<GroupId>,
		launcher: &mut L,
		max_fail_count: u32,
	) -> Reconciliation {
		let mut report = Reconciliation::default();

		for group in desired {
			if !self.workers.contains_key(group) {
				self.workers.insert(group.clone(), Worker::new(group.clone()));
				report.added.push(group.clone());
			}
		}

		let obsolete: Vec<GroupId> = self
			.workers
			.keys()
			.filter(|name| !desired.contains(*name))
			.cloned()
			.collect();

		for name in obsolete {
			let Some(worker) = self.workers.get_mut(&name) else {
				continue;
			};
			if worker.is_running() {
				let sig = worker.escalation_signal(max_fail_count);
				tracing::info!(group = %name, pid = ?worker.pid(), signal = ?sig, "stopping obsolete worker");
				match worker.kill(launcher, sig) {
					Ok(()) => report.signalled.push((name.clone(), sig)),
					Err(SupervisorError::ProcessGone { pid }) => {
						tracing::debug!(group = %name, %pid, "obsolete worker already gone");
					}
					Err(e) => tracing::error!(group = %name, "failed to signal obsolete worker: {}", e),
				}
			}
			if !worker.is_running() {
				tracing::info!(group = %name, "dropping obsolete worker");
				self.workers.remove(&name);
				report.dropped.push(name);
			}
		}

		report
	}

	/// Collect every exited child and settle the matching worker.
	pub fn reap<L: Launcher + ?Sized>(
		&mut self,
		launcher: &mut L,
		max_fail_count: u32,
	) -> Result<Vec<Reaped>> {
		let mut reaped = Vec::new();
		while let Some(exit) = launcher.reap()? {
			self.settle(exit, max_fail_count);
			reaped.push(exit);
		}
		Ok(reaped)
	}

	fn settle(&mut self, reaped: Reaped, max_fail_count: u32) {
		let Some(worker) = self.find_by_pid(reaped.pid) else {
			tracing::warn!(pid = %reaped.pid, exit = %reaped.exit, "reaped unknown worker pid, ignoring");
			return;
		};

		if worker.exited(reaped.exit) {
			tracing::warn!(
				group = %worker.name(),
				pid = %reaped.pid,
				exit = %reaped.exit,
				fail_count = worker.fail_count(),
				"worker failed"
			);
			if worker.is_exhausted(max_fail_count) {
				tracing::error!(
					group = %worker.name(),
					fail_count = worker.fail_count(),
					"worker keeps failing, not restarting until reload"
				);
			}
		} else {
			tracing::info!(group = %worker.name(), pid = %reaped.pid, "worker exited");
		}
	}

	fn find_by_pid(&mut self, pid: Pid) -> Option<&mut Worker> {
		self.workers.values_mut().find(|w| w.pid() == Some(pid))
	}

	/// Start a process for every idle, desired worker that has not failed too often.
	///
	/// Obsolete entries waiting to be dropped are never respawned.
	pub fn spawn_missing<L: Launcher + ?Sized>(
		&mut self,
		desired: &BTreeSet<GroupId>,
		launcher: &mut L,
		max_fail_count: u32,
	) -> Vec<(GroupId, Pid)> {
		let mut spawned = Vec::new();
		for worker in self.workers.values_mut() {
			if worker.is_running()
				|| worker.is_exhausted(max_fail_count)
				|| !desired.contains(worker.name())
			{
				continue;
			}
			match launcher.spawn(worker.name()) {
				Ok(pid) => {
					tracing::info!(group = %worker.name(), %pid, "worker started");
					worker.started(pid);
					spawned.push((worker.name().to_string(), pid));
				}
				Err(e) => {
					worker.record_failure();
					tracing::error!(
						group = %worker.name(),
						fail_count = worker.fail_count(),
						"{}",
						e
					);
				}
			}
		}
		spawned
	}

	/// Send `sig` to every running worker. Returns how many processes the
	/// signal actually reached.
	///
	/// Workers whose process has vanished have their pid cleared and are not counted.
	pub fn signal_running<L: Launcher + ?Sized>(&mut self, launcher: &mut L, sig: Signal) -> usize {
		let mut count = 0;
		for worker in self.workers.values_mut().filter(|w| w.is_running()) {
			match worker.kill(launcher, sig) {
				Ok(()) => count += 1,
				Err(SupervisorError::ProcessGone { pid }) => {
					tracing::debug!(group = %worker.name(), %pid, "worker already gone");
				}
				Err(e) => tracing::error!(group = %worker.name(), signal = ?sig, "failed to signal worker: {}", e),
			}
		}
		count
	}

	pub fn reset_failures(&mut self) {
		for worker in self.workers.values_mut() {
			worker.reset_failures();
		}
	}
}
