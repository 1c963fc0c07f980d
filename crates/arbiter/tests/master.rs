use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use arbiter::{
	Configuration, ExitKind, Launcher, Master, MasterState, Reaped, SignalRouter, SupervisorError,
	Thresholds,
};

// --- Scripted launcher ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proc {
	Running,
	Zombie,
}

/// Processes stay killable until reaped, like real zombies.
#[derive(Default)]
struct FakeState {
	next_pid: i32,
	procs: BTreeMap<Pid, Proc>,
	spawned: Vec<(String, Pid)>,
	kills: Vec<(Pid, Signal)>,
	exits: VecDeque<Reaped>,
	exit_on_term: bool,
	crash: BTreeSet<String>,
	unspawnable: BTreeSet<String>,
}

#[derive(Clone, Default)]
struct FakeLauncher(Arc<Mutex<FakeState>>);

impl FakeLauncher {
	fn obedient() -> Self {
		let fake = Self::default();
		fake.state().exit_on_term = true;
		fake
	}

	fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
		self.0.lock().unwrap()
	}

	fn exit(&self, pid: Pid, code: i32) {
		let mut s = self.state();
		s.procs.insert(pid, Proc::Zombie);
		s.exits.push_back(Reaped { pid, exit: ExitKind::Code(code) });
	}

	fn kills_with(&self, sig: Signal) -> usize {
		self.state().kills.iter().filter(|(_, s)| *s == sig).count()
	}

	fn spawns_of(&self, group: &str) -> usize {
		self.state().spawned.iter().filter(|(g, _)| g == group).count()
	}
}

impl Launcher for FakeLauncher {
	fn spawn(&mut self, group: &str) -> arbiter::Result<Pid> {
		let mut s = self.state();
		if s.unspawnable.contains(group) {
			return Err(SupervisorError::Spawn {
				group: group.to_string(),
				reason: "no such binary".into(),
			});
		}
		s.next_pid += 1;
		let pid = Pid::from_raw(5000 + s.next_pid);
		s.spawned.push((group.to_string(), pid));
		if s.crash.contains(group) {
			s.procs.insert(pid, Proc::Zombie);
			s.exits.push_back(Reaped { pid, exit: ExitKind::Code(1) });
		} else {
			s.procs.insert(pid, Proc::Running);
		}
		Ok(pid)
	}

	fn kill(&mut self, pid: Pid, sig: Signal) -> nix::Result<()> {
		let mut s = self.state();
		let Some(state) = s.procs.get(&pid).copied() else {
			return Err(Errno::ESRCH);
		};
		s.kills.push((pid, sig));
		let fatal = sig == Signal::SIGKILL || (sig == Signal::SIGTERM && s.exit_on_term);
		if state == Proc::Running && fatal {
			s.procs.insert(pid, Proc::Zombie);
			s.exits.push_back(Reaped { pid, exit: ExitKind::Signaled(sig) });
		}
		Ok(())
	}

	fn reap(&mut self) -> arbiter::Result<Option<Reaped>> {
		let mut s = self.state();
		let next = s.exits.pop_front();
		if let Some(r) = &next {
			s.procs.remove(&r.pid);
		}
		Ok(next)
	}
}

// --- Live configuration ---

#[derive(Clone)]
struct Desired(Arc<Mutex<BTreeSet<String>>>);

impl Desired {
	fn new(names: &[&str]) -> Self {
		Desired(Arc::new(Mutex::new(names.iter().map(|s| s.to_string()).collect())))
	}

	fn set(&self, names: &[&str]) {
		*self.0.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
	}
}

struct LiveGroups(Desired);

impl Configuration for LiveGroups {
	fn consumer_groups(&self) -> BTreeSet<String> {
		self.0 .0.lock().unwrap().clone()
	}

	fn filter_consumers(&mut self, _groups: &BTreeSet<String>) {}
}

fn thresholds() -> Thresholds {
	Thresholds {
		max_fail_count: 3,
		stop_timeout: Duration::from_millis(300),
		reload_timeout: Duration::from_millis(300),
		max_signal_queue: 5,
	}
}

fn master(
	desired: &Desired,
	launcher: &FakeLauncher,
) -> (
	Master<impl Fn() -> arbiter::Result<LiveGroups> + Send + Sync, FakeLauncher>,
	Arc<SignalRouter>,
) {
	let router = SignalRouter::new(5).unwrap();
	let desired = desired.clone();
	let factory = move || -> arbiter::Result<LiveGroups> { Ok(LiveGroups(desired.clone())) };
	let m = Master::new(factory, launcher.clone(), Arc::clone(&router), thresholds());
	(m, router)
}

// --- Reconciliation ---

#[tokio::test]
async fn add_then_remove_group() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::default();
	let (mut m, _router) = master(&desired, &launcher);

	m.tick().unwrap();
	assert_eq!(m.registry().len(), 2);
	let a_pid = m.registry().get("A").unwrap().pid().unwrap();
	let b_pid = m.registry().get("B").unwrap().pid().unwrap();

	desired.set(&["A"]);
	m.tick().unwrap();
	assert_eq!(launcher.state().kills, vec![(b_pid, Signal::SIGTERM)]);
	assert!(m.registry().get("B").is_some());

	// B exits; it is reaped but not respawned, then dropped on the next pass.
	launcher.exit(b_pid, 0);
	m.tick().unwrap();
	assert_eq!(launcher.spawns_of("B"), 1);
	m.tick().unwrap();
	assert!(m.registry().get("B").is_none());

	let a = m.registry().get("A").unwrap();
	assert_eq!(a.pid(), Some(a_pid));
	assert_eq!(launcher.spawns_of("A"), 1);
}

#[tokio::test]
async fn steady_state_ticks_do_nothing() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::default();
	let (mut m, _router) = master(&desired, &launcher);

	m.tick().unwrap();
	m.tick().unwrap();
	m.tick().unwrap();
	assert_eq!(launcher.state().spawned.len(), 2);
	assert!(launcher.state().kills.is_empty());
}

// --- Failures ---

#[tokio::test]
async fn crashing_group_stops_at_max_fail_count() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::default();
	launcher.state().crash.insert("A".into());
	let (mut m, _router) = master(&desired, &launcher);

	let mut last = 0;
	for _ in 0..10 {
		m.tick().unwrap();
		let fails = m.registry().get("A").unwrap().fail_count();
		assert!(fails >= last);
		last = fails;
	}

	let a = m.registry().get("A").unwrap();
	assert_eq!(a.fail_count(), 3);
	assert!(!a.is_running());
	assert_eq!(launcher.spawns_of("A"), 3);

	// The healthy group is unaffected.
	let b = m.registry().get("B").unwrap();
	assert!(b.is_running());
	assert_eq!(b.fail_count(), 0);
	assert_eq!(launcher.spawns_of("B"), 1);
}

#[tokio::test]
async fn unspawnable_group_counts_as_failure() {
	let desired = Desired::new(&["A"]);
	let launcher = FakeLauncher::default();
	launcher.state().unspawnable.insert("A".into());
	let (mut m, _router) = master(&desired, &launcher);

	for _ in 0..6 {
		m.tick().unwrap();
	}
	let a = m.registry().get("A").unwrap();
	assert_eq!(a.fail_count(), 3);
	assert!(!a.is_running());
}

// --- Reload ---

#[tokio::test]
async fn reload_resets_failures_and_configuration() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::obedient();
	launcher.state().crash.insert("A".into());
	let (mut m, _router) = master(&desired, &launcher);

	for _ in 0..5 {
		m.tick().unwrap();
	}
	assert_eq!(m.registry().get("A").unwrap().fail_count(), 3);
	let before = m.configuration().unwrap();
	assert_eq!(m.config_generation(), 1);

	let drained = m.reload().await;
	assert_eq!(drained.killed, 0);
	assert_eq!(m.state(), MasterState::Running);
	assert!(m.registry().workers().all(|w| w.fail_count() == 0));
	assert_eq!(m.registry().running(), 0);
	assert!(launcher.kills_with(Signal::SIGTERM) >= 1);

	let after = m.configuration().unwrap();
	assert!(!Arc::ptr_eq(&before, &after));
	assert_eq!(m.config_generation(), 2);

	// Everything comes back on the next pass.
	launcher.state().crash.clear();
	m.tick().unwrap();
	assert_eq!(m.registry().running(), 2);
}

#[tokio::test]
async fn reload_kills_stragglers_after_timeout() {
	let desired = Desired::new(&["A"]);
	let launcher = FakeLauncher::default();
	let (mut m, _router) = master(&desired, &launcher);
	m.tick().unwrap();

	let drained = m.reload().await;
	assert_eq!(drained.killed, 1);
	assert!(drained.elapsed >= Duration::from_millis(300));
	assert!(drained.elapsed < Duration::from_millis(800));
	assert_eq!(launcher.kills_with(Signal::SIGKILL), 1);

	// The SIGKILLed process is reaped before its replacement starts, and
	// our own kill is not held against the group.
	m.tick().unwrap();
	assert_eq!(launcher.spawns_of("A"), 2);
	let a = m.registry().get("A").unwrap();
	assert_eq!(a.fail_count(), 0);
	assert!(a.is_running());
}

#[tokio::test]
async fn reload_straggler_is_restarted_with_single_failure_budget() {
	let desired = Desired::new(&["A"]);
	let launcher = FakeLauncher::default();
	let router = SignalRouter::new(5).unwrap();
	let live = desired.clone();
	let factory = move || -> arbiter::Result<LiveGroups> { Ok(LiveGroups(live.clone())) };
	let limits = Thresholds {
		max_fail_count: 1,
		..thresholds()
	};
	let mut m = Master::new(factory, launcher.clone(), router, limits);
	m.tick().unwrap();

	let drained = m.reload().await;
	assert_eq!(drained.killed, 1);
	assert_eq!(m.registry().get("A").unwrap().fail_count(), 0);

	for _ in 0..3 {
		m.tick().unwrap();
	}
	let a = m.registry().get("A").unwrap();
	assert_eq!(a.fail_count(), 0);
	assert!(a.is_running());
	assert_eq!(launcher.spawns_of("A"), 2);
}

// --- Stop ---

#[tokio::test]
async fn stop_is_bounded_by_timeout() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::default();
	let (mut m, _router) = master(&desired, &launcher);
	m.tick().unwrap();

	let started = std::time::Instant::now();
	let drained = m.stop().await;
	let elapsed = started.elapsed();

	assert_eq!(drained.killed, 2);
	assert!(elapsed >= Duration::from_millis(300));
	assert!(elapsed < Duration::from_millis(800), "stop took {:?}", elapsed);
	assert_eq!(launcher.kills_with(Signal::SIGKILL), 2);
	// SIGTERM was retried while waiting.
	assert!(launcher.kills_with(Signal::SIGTERM) >= 4);
	assert_eq!(m.state(), MasterState::Terminated);
}

#[tokio::test]
async fn stop_returns_early_when_workers_obey() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::obedient();
	let (mut m, _router) = master(&desired, &launcher);
	m.tick().unwrap();

	let drained = m.stop().await;
	assert_eq!(drained.killed, 0);
	assert!(drained.elapsed < Duration::from_millis(300));
	assert_eq!(launcher.kills_with(Signal::SIGKILL), 0);
	assert_eq!(m.registry().running(), 0);
}

#[tokio::test]
async fn stop_tolerates_vanished_processes() {
	let desired = Desired::new(&["A"]);
	let launcher = FakeLauncher::default();
	let (mut m, _router) = master(&desired, &launcher);
	m.tick().unwrap();

	// Gone without a trace: kill sees ESRCH.
	launcher.state().procs.clear();
	let drained = m.stop().await;
	assert_eq!(drained.killed, 0);
	assert_eq!(m.registry().running(), 0);
}

#[tokio::test]
async fn vanished_processes_are_not_reported_as_killed() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::default();
	let (mut m, _router) = master(&desired, &launcher);
	m.tick().unwrap();

	// B disappears while stop is already waiting on both.
	let b_pid = m.registry().get("B").unwrap().pid().unwrap();
	let remover = launcher.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(150)).await;
		remover.state().procs.remove(&b_pid);
	});

	let drained = m.stop().await;
	assert_eq!(drained.killed, 1);
	assert_eq!(launcher.kills_with(Signal::SIGKILL), 1);
}

// --- Signal-driven loop ---

#[tokio::test]
async fn terminate_signal_ends_run_and_stops_workers() {
	let desired = Desired::new(&["A", "B"]);
	let launcher = FakeLauncher::obedient();
	let (mut m, router) = master(&desired, &launcher);

	router.deliver(Signal::SIGTERM).unwrap();
	tokio::time::timeout(Duration::from_secs(5), m.run())
		.await
		.unwrap()
		.unwrap();

	assert_eq!(m.state(), MasterState::Terminated);
	assert_eq!(m.registry().running(), 0);
	assert_eq!(launcher.kills_with(Signal::SIGTERM), 2);
}

#[tokio::test]
async fn signals_are_handled_in_order() {
	let desired = Desired::new(&["A"]);
	let launcher = FakeLauncher::obedient();
	let (mut m, router) = master(&desired, &launcher);

	router.deliver(Signal::SIGUSR1).unwrap();
	router.deliver(Signal::SIGHUP).unwrap();
	router.deliver(Signal::SIGTERM).unwrap();
	tokio::time::timeout(Duration::from_secs(5), m.run())
		.await
		.unwrap()
		.unwrap();

	// Reload rebuilt the configuration and respawned A before terminating.
	assert_eq!(m.config_generation(), 2);
	assert_eq!(launcher.spawns_of("A"), 2);
	assert_eq!(router.pending(), 0);
}

#[tokio::test]
async fn signal_during_wait_wakes_the_loop() {
	let desired = Desired::new(&["A"]);
	let launcher = FakeLauncher::obedient();
	let (mut m, router) = master(&desired, &launcher);

	let sender = Arc::clone(&router);
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(100)).await;
		sender.deliver(Signal::SIGTERM).unwrap();
	});

	let started = std::time::Instant::now();
	m.run().await.unwrap();
	// Well before the 1s polling tick would have noticed.
	assert!(started.elapsed() < Duration::from_millis(900));
}

#[tokio::test]
async fn loop_error_still_stops_workers() {
	let launcher = FakeLauncher::obedient();
	let router = SignalRouter::new(5).unwrap();
	let builds = Arc::new(Mutex::new(0u32));
	let counter = Arc::clone(&builds);
	let desired = Desired::new(&["A"]);

	// The configuration breaks after the first reload.
	let factory = move || -> arbiter::Result<LiveGroups> {
		let mut n = counter.lock().unwrap();
		*n += 1;
		if *n > 1 {
			return Err(SupervisorError::Config("broken file".into()));
		}
		Ok(LiveGroups(desired.clone()))
	};
	let mut m = Master::new(factory, launcher.clone(), Arc::clone(&router), thresholds());

	router.deliver(Signal::SIGHUP).unwrap();
	let result = tokio::time::timeout(Duration::from_secs(5), m.run()).await.unwrap();

	assert!(matches!(result, Err(SupervisorError::Config(_))));
	assert_eq!(m.state(), MasterState::Terminated);
	assert_eq!(m.registry().running(), 0);
	assert_eq!(*builds.lock().unwrap(), 2);
}
