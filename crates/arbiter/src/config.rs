//! Configuration provider seam.
//!
//! The arbiter never looks inside a configuration beyond two questions: which
//! consumer groups exist, and "please restrict yourself to these". Building a
//! configuration can be expensive, so it is deferred until first use and only
//! ever replaced wholesale.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;

/// Name of a consumer group, the unit a single worker is assigned.
pub type GroupId = String;

pub trait Configuration: Send + Sync + 'static {
	/// The consumer groups this configuration currently yields.
	fn consumer_groups(&self) -> BTreeSet<GroupId>;

	/// Restrict the configuration to `groups`, in place.
	///
	/// Called at most once per instance, right after creation.
	fn filter_consumers(&mut self, groups: &BTreeSet<GroupId>);
}

/// Builds fresh configuration instances.
pub trait ConfigurationFactory: Send + Sync {
	type Config: Configuration;

	fn create(&self) -> Result<Self::Config>;
}

impl<C, F> ConfigurationFactory for F
where
	C: Configuration,
	F: Fn() -> Result<C> + Send + Sync,
{
	type Config = C;

	fn create(&self) -> Result<C> {
		self()
	}
}

/// Lazily built, optionally group-restricted configuration.
pub struct DeferredConfig<F: ConfigurationFactory> {
	factory: F,
	restrict: Option<BTreeSet<GroupId>>,
	current: Option<Arc<F::Config>>,
	generation: u64,
}

impl<F: ConfigurationFactory> DeferredConfig<F> {
	pub fn new(factory: F) -> Self {
		Self {
			factory,
			restrict: None,
			current: None,
			generation: 0,
		}
	}

	/// Every instance built by this holder is restricted to `groups`.
	pub fn restricted(factory: F, groups: BTreeSet<GroupId>) -> Self {
		Self {
			restrict: Some(groups),
			..Self::new(factory)
		}
	}

	/// Current configuration, building it on first access.
	pub fn get(&mut self) -> Result<Arc<F::Config>> {
		if let Some(config) = &self.current {
			return Ok(Arc::clone(config));
		}

		let mut config = self.factory.create()?;
		if let Some(groups) = &self.restrict {
			config.filter_consumers(groups);
		}
		let config = Arc::new(config);
		self.generation += 1;
		tracing::debug!(generation = self.generation, "configuration built");
		self.current = Some(Arc::clone(&config));
		Ok(config)
	}

	/// Drop the cached instance; the next `get` builds a new one.
	pub fn reset(&mut self) {
		self.current = None;
	}

	pub fn is_built(&self) -> bool {
		self.current.is_some()
	}

	/// Number of instances built so far.
	pub fn generation(&self) -> u64 {
		self.generation
	}
}
