//! Work-execution contexts for mailbox consumers and timers.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

/// Default worker count of the fallback runtime.
pub const DEFAULT_FALLBACK_THREADS: usize = 2;

/// Execution classes used to tag spawned consumer work in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Consumers whose latency is user visible.
	Interactive,
	/// Consumers and timers that tolerate queueing delay.
	Background,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Interactive => "interactive",
			Self::Background => "background",
		}
	}
}

/// Where a mailbox consumer runs its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkContext {
	/// The sending task delivers inline, before `send` returns.
	#[default]
	Immediate,
	/// A dedicated task per mailbox drains the queue.
	Spawned(TaskClass),
}

impl WorkContext {
	pub const fn interactive() -> Self {
		Self::Spawned(TaskClass::Interactive)
	}

	pub const fn background() -> Self {
		Self::Spawned(TaskClass::Background)
	}

	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Immediate => "immediate",
			Self::Spawned(class) => class.as_str(),
		}
	}
}

/// Runtime owned by one router, built on first use outside tokio.
struct Fallback(Option<Runtime>);

impl Drop for Fallback {
	fn drop(&mut self) {
		// The last router handle may be released on one of this runtime's
		// own workers, where a blocking shutdown would panic.
		if let Some(runtime) = self.0.take() {
			runtime.shutdown_background();
		}
	}
}

struct SpawnerInner {
	threads: usize,
	fallback: OnceLock<Option<Fallback>>,
}

/// Task launcher shared by the registry and the scheduler of one router.
///
/// Work goes to the ambient tokio runtime when there is one. Callers outside
/// tokio get a multi-thread runtime private to the router.
#[derive(Clone)]
pub(crate) struct Spawner {
	inner: Arc<SpawnerInner>,
}

impl Spawner {
	pub(crate) fn new(threads: usize) -> Self {
		Self {
			inner: Arc::new(SpawnerInner {
				threads: threads.max(1),
				fallback: OnceLock::new(),
			}),
		}
	}

	fn handle(&self) -> Option<Handle> {
		if let Ok(handle) = Handle::try_current() {
			return Some(handle);
		}
		let fallback = self.inner.fallback.get_or_init(|| {
			let built = tokio::runtime::Builder::new_multi_thread()
				.enable_all()
				.worker_threads(self.inner.threads)
				.thread_name("courier-router-worker")
				.build();
			match built {
				Ok(runtime) => {
					tracing::debug!(threads = self.inner.threads, "router.work.fallback_runtime");
					Some(Fallback(Some(runtime)))
				}
				Err(err) => {
					tracing::error!(error = %err, "router.work.fallback_runtime_failed");
					None
				}
			}
		});
		fallback.as_ref().and_then(|f| f.0.as_ref()).map(|rt| rt.handle().clone())
	}

	/// Spawns `fut` tagged with `class`. Returns `None`, after logging, when no
	/// runtime is available to run it.
	pub(crate) fn spawn<F>(&self, class: TaskClass, fut: F) -> Option<JoinHandle<F::Output>>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		let Some(handle) = self.handle() else {
			tracing::error!(work_class = class.as_str(), "router.work.dropped");
			return None;
		};
		tracing::trace!(work_class = class.as_str(), "router.work.spawn");
		Some(handle.spawn(fut))
	}

	/// Returns true once this spawner has built its private runtime.
	#[cfg(test)]
	fn owns_runtime(&self) -> bool {
		self.inner.fallback.get().is_some_and(Option::is_some)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spawn_outside_tokio_uses_private_runtime() {
		let spawner = Spawner::new(1);
		let join = spawner.spawn(TaskClass::Background, async { 21 * 2 }).unwrap();
		assert!(spawner.owns_runtime());

		let (tx, rx) = std::sync::mpsc::channel();
		spawner.spawn(TaskClass::Background, async move {
			let _ = tx.send(join.await.unwrap());
		});
		assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(2)), Ok(42));
	}

	#[tokio::test]
	async fn spawn_inside_tokio_uses_ambient_runtime() {
		let spawner = Spawner::new(1);
		let value = spawner.spawn(TaskClass::Interactive, async { 7 }).unwrap().await.unwrap();
		assert_eq!(value, 7);
		assert!(!spawner.owns_runtime());
	}

	#[test]
	fn separate_spawners_do_not_share_runtimes() {
		let a = Spawner::new(1);
		let b = Spawner::new(1);
		let _ = a.spawn(TaskClass::Background, async {});
		assert!(a.owns_runtime());
		assert!(!b.owns_runtime());
	}

	#[test]
	fn default_context_is_immediate() {
		assert_eq!(WorkContext::default(), WorkContext::Immediate);
		assert_eq!(WorkContext::background().as_str(), "background");
	}
}
