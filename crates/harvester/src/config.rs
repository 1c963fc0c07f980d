use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use arbiter::{Configuration, ConfigurationFactory, GroupId, SupervisorError, Thresholds};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HarvestConfig {
	#[serde(default)]
	pub supervisor: SupervisorSettings,
	#[serde(default)]
	pub consumers: BTreeMap<String, ConsumerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
	#[serde(default = "default_max_fail_count")]
	pub max_fail_count: u32,
	#[serde(default = "default_timeout")]
	pub stop_timeout: f64,
	#[serde(default = "default_timeout")]
	pub reload_timeout: f64,
	#[serde(default = "default_max_signal_queue")]
	pub max_signal_queue: usize,
	#[serde(default = "default_watchdog_interval")]
	pub watchdog_interval: f64,
}

impl Default for SupervisorSettings {
	fn default() -> Self {
		Self {
			max_fail_count: default_max_fail_count(),
			stop_timeout: default_timeout(),
			reload_timeout: default_timeout(),
			max_signal_queue: default_max_signal_queue(),
			watchdog_interval: default_watchdog_interval(),
		}
	}
}

fn default_max_fail_count() -> u32 {
	3
}
fn default_timeout() -> f64 {
	10.0
}
fn default_max_signal_queue() -> usize {
	arbiter::signals::DEFAULT_MAX_SIGNAL_QUEUE
}
fn default_watchdog_interval() -> f64 {
	1.0
}

impl SupervisorSettings {
	pub fn thresholds(&self) -> arbiter::Result<Thresholds> {
		if self.max_signal_queue == 0 {
			return Err(SupervisorError::Config("max_signal_queue must be at least 1".into()));
		}
		Ok(Thresholds {
			max_fail_count: self.max_fail_count,
			stop_timeout: seconds("stop_timeout", self.stop_timeout)?,
			reload_timeout: seconds("reload_timeout", self.reload_timeout)?,
			max_signal_queue: self.max_signal_queue,
		})
	}

	pub fn watchdog_interval(&self) -> arbiter::Result<Duration> {
		let interval = seconds("watchdog_interval", self.watchdog_interval)?;
		if interval.is_zero() {
			return Err(SupervisorError::Config("watchdog_interval must be positive".into()));
		}
		Ok(interval)
	}
}

fn seconds(field: &str, value: f64) -> arbiter::Result<Duration> {
	Duration::try_from_secs_f64(value)
		.map_err(|_| SupervisorError::Config(format!("{} must be a non-negative number of seconds, got {}", field, value)))
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConsumerConfig {
	/// Consumer group; defaults to the consumer's name.
	pub group: Option<String>,
	#[serde(default)]
	pub paths: Vec<PathBuf>,
}

impl HarvestConfig {
	pub fn parse(content: &str) -> arbiter::Result<Self> {
		toml::from_str(content).map_err(|e| SupervisorError::Config(e.to_string()))
	}

	/// Read `path`. A missing file yields the defaults.
	pub fn load(path: &Path) -> arbiter::Result<Self> {
		let content = match std::fs::read_to_string(path) {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				tracing::debug!(path = %path.display(), "no configuration file, using defaults");
				return Ok(Self::default());
			}
			Err(e) => {
				return Err(SupervisorError::Config(format!("failed to read {}: {}", path.display(), e)));
			}
		};
		Self::parse(&content).map_err(|e| match e {
			SupervisorError::Config(reason) => SupervisorError::Config(format!("{}: {}", path.display(), reason)),
			other => other,
		})
	}

	pub fn group_of<'a>(&'a self, name: &'a str) -> Option<&'a str> {
		self.consumers
			.get(name)
			.map(|c| c.group.as_deref().unwrap_or(name))
	}

	/// Consumer names per group.
	pub fn consumers_by_group(&self) -> BTreeMap<GroupId, Vec<&str>> {
		let mut groups: BTreeMap<GroupId, Vec<&str>> = BTreeMap::new();
		for (name, consumer) in &self.consumers {
			let group = consumer.group.as_deref().unwrap_or(name);
			groups.entry(group.to_string()).or_default().push(name);
		}
		groups
	}

	/// Every path configured by the consumers in scope.
	pub fn watched_paths(&self) -> Vec<PathBuf> {
		let mut paths: Vec<PathBuf> = self.consumers.values().flat_map(|c| c.paths.iter().cloned()).collect();
		paths.sort();
		paths.dedup();
		paths
	}
}

impl Configuration for HarvestConfig {
	fn consumer_groups(&self) -> BTreeSet<GroupId> {
		self.consumers_by_group().into_keys().collect()
	}

	fn filter_consumers(&mut self, groups: &BTreeSet<GroupId>) {
		self.consumers
			.retain(|name, consumer| groups.contains(consumer.group.as_deref().unwrap_or(name)));
	}
}

/// Builds a fresh [`HarvestConfig`] from disk on every call.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
	path: PathBuf,
}

impl ConfigLoader {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl ConfigurationFactory for ConfigLoader {
	type Config = HarvestConfig;

	fn create(&self) -> arbiter::Result<HarvestConfig> {
		HarvestConfig::load(&self.path)
	}
}
