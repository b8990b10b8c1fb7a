//! Router configuration.

use serde::Deserialize;
use thiserror::Error;

use crate::mailbox::DEFAULT_MAILBOX_CAPACITY;
use crate::work::DEFAULT_FALLBACK_THREADS;

/// Errors that can occur when loading a [`RouterConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error parsing TOML syntax or field types.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// A numeric field must be positive.
	#[error("{field} must be greater than zero")]
	Zero {
		/// The offending field name.
		field: &'static str,
	},
}

/// Tunables for one router instance.
///
/// ```toml
/// mailbox_capacity = 32
/// postpone_disabled = false
/// fallback_worker_threads = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
	/// Buffer size of every mailbox created by the registry.
	pub mailbox_capacity: usize,
	/// When set, `postpone` tears the mailbox down like `unregister` instead
	/// of keeping a buffering placeholder.
	pub postpone_disabled: bool,
	/// Worker threads of the runtime used when the router is driven from
	/// outside tokio. Only the first runtime built in a process honors it.
	pub fallback_worker_threads: usize,
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
			postpone_disabled: false,
			fallback_worker_threads: DEFAULT_FALLBACK_THREADS,
		}
	}
}

impl RouterConfig {
	/// Parses and validates a TOML document. Missing keys take defaults.
	pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(src)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.mailbox_capacity == 0 {
			return Err(ConfigError::Zero { field: "mailbox_capacity" });
		}
		if self.fallback_worker_threads == 0 {
			return Err(ConfigError::Zero {
				field: "fallback_worker_threads",
			});
		}
		Ok(())
	}

	/// Sets the mailbox capacity.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	#[must_use]
	pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		self.mailbox_capacity = capacity;
		self
	}

	#[must_use]
	pub fn postpone_disabled(mut self, disabled: bool) -> Self {
		self.postpone_disabled = disabled;
		self
	}

	#[must_use]
	pub fn fallback_worker_threads(mut self, threads: usize) -> Self {
		assert!(threads > 0, "fallback worker threads must be > 0");
		self.fallback_worker_threads = threads;
		self
	}
}
