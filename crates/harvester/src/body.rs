//! The monitoring body run by every worker and by `run --foreground`.
//!
//! It only watches how large the configured files are. Reading, parsing and
//! shipping their contents is left to a real harvesting backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arbiter::{ControlToken, WorkBody};

use crate::config::HarvestConfig;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
	Appeared(u64),
	Grew(u64),
	/// Smaller than last time; rotated or truncated.
	Shrank(u64),
	Vanished,
}

/// Last known size per path.
#[derive(Debug, Default)]
pub struct SizeLedger {
	sizes: HashMap<PathBuf, Option<u64>>,
}

impl SizeLedger {
	/// Record the current size of `path` (`None` if it does not exist) and
	/// report what changed since the previous observation.
	pub fn observe(&mut self, path: &Path, size: Option<u64>) -> Option<Change> {
		let previous = self.sizes.insert(path.to_path_buf(), size).flatten();
		match (previous, size) {
			(None, Some(now)) => Some(Change::Appeared(now)),
			(Some(_), None) => Some(Change::Vanished),
			(Some(before), Some(now)) if now > before => Some(Change::Grew(now - before)),
			(Some(before), Some(now)) if now < before => Some(Change::Shrank(now)),
			_ => None,
		}
	}
}

pub struct StatBody {
	interval: Duration,
}

impl StatBody {
	pub fn new(interval: Duration) -> Self {
		Self { interval }
	}
}

impl Default for StatBody {
	fn default() -> Self {
		Self::new(DEFAULT_POLL_INTERVAL)
	}
}

impl WorkBody<HarvestConfig> for StatBody {
	async fn run_monitor(
		&self,
		paths: &[PathBuf],
		config: Arc<HarvestConfig>,
		mut control: ControlToken,
	) -> arbiter::Result<()> {
		let mut watched = config.watched_paths();
		watched.extend(paths.iter().cloned());
		watched.sort();
		watched.dedup();

		let groups: Vec<String> = config.consumers_by_group().into_keys().collect();
		tracing::info!(?groups, files = watched.len(), "monitoring");

		let mut ledger = SizeLedger::default();
		let mut ticker = tokio::time::interval(self.interval);
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					for path in &watched {
						let size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
						match ledger.observe(path, size) {
							Some(Change::Appeared(bytes)) => tracing::info!(path = %path.display(), bytes, "file appeared"),
							Some(Change::Grew(bytes)) => tracing::info!(path = %path.display(), bytes, "file grew"),
							Some(Change::Shrank(bytes)) => tracing::info!(path = %path.display(), bytes, "file truncated or rotated"),
							Some(Change::Vanished) => tracing::warn!(path = %path.display(), "file vanished"),
							None => {}
						}
					}
				}
				reason = control.interrupted() => {
					tracing::debug!(?reason, "monitoring interrupted");
					return Ok(());
				}
			}
		}
	}
}
