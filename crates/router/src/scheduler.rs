//! Delayed delivery with per-address, per-id deduplication.
//!
//! Each pending send owns a timer task and an entry in its address group.
//! Firing and cancellation both remove the entry under the group lock; only
//! the side that removes it acts, so a cancel that wins the lock always
//! prevents delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_primitives::{Address, Addressable, Message, MessageId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::work::{Spawner, TaskClass};

struct Pending {
	seq: u64,
	cancel: CancellationToken,
}

type Groups = HashMap<Address, HashMap<MessageId, Pending>>;

struct SchedulerInner {
	registry: Registry,
	spawner: Spawner,
	groups: Mutex<Groups>,
	seq: AtomicU64,
}

impl SchedulerInner {
	/// Removes the entry for `(address, id)` if it is still generation `seq`,
	/// dropping the group once empty.
	fn take(&self, address: Address, id: MessageId, seq: u64) -> Option<Pending> {
		let mut groups = self.groups.lock();
		let group = groups.get_mut(&address)?;
		if group.get(&id).is_none_or(|p| p.seq != seq) {
			return None;
		}
		let pending = group.remove(&id);
		if group.is_empty() {
			groups.remove(&address);
		}
		pending
	}

	fn is_pending(&self, address: Address, id: MessageId, seq: u64) -> bool {
		self.groups
			.lock()
			.get(&address)
			.and_then(|group| group.get(&id))
			.is_some_and(|p| p.seq == seq)
	}
}

/// Per-address table of pending delayed sends.
#[derive(Clone)]
pub struct ActorScheduler {
	inner: Arc<SchedulerInner>,
}

impl ActorScheduler {
	/// Creates a scheduler that fires into `registry`, spawning its timers on
	/// the registry's runtime.
	pub fn new(registry: Registry) -> Self {
		let spawner = registry.spawner().clone();
		Self {
			inner: Arc::new(SchedulerInner {
				registry,
				spawner,
				groups: Mutex::new(HashMap::new()),
				seq: AtomicU64::new(1),
			}),
		}
	}

	/// Starts a delayed send: `scheduler.after(delay).send(message, address)`.
	pub fn after(&self, delay: Duration) -> ScheduledSend<'_> {
		ScheduledSend { scheduler: self, delay }
	}

	fn schedule(&self, delay: Duration, message: Message, address: Address) -> Cancellable {
		let id = message.id();
		let (seq, cancel) = {
			let mut groups = self.inner.groups.lock();
			let group = groups.entry(address).or_default();
			if let Some(existing) = group.get(&id) {
				tracing::trace!(%address, id, seq = existing.seq, "scheduler.deduplicated");
				return self.handle(address, id, existing.seq);
			}
			let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
			let cancel = CancellationToken::new();
			group.insert(id, Pending { seq, cancel: cancel.clone() });
			(seq, cancel)
		};
		tracing::debug!(%address, id, seq, ?delay, "scheduler.schedule");

		let inner = Arc::clone(&self.inner);
		let _ = self.inner.spawner.spawn(TaskClass::Background, async move {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return,
				_ = tokio::time::sleep(delay) => {}
			}
			if inner.take(address, id, seq).is_none() {
				tracing::trace!(%address, id, seq, "scheduler.fire.cancelled");
				return;
			}
			tracing::debug!(%address, id, seq, "scheduler.fire");
			if let Err(err) = inner.registry.send(&message, &[address]).await {
				tracing::warn!(%address, id, error = %err, "scheduler.fire.failed");
			}
		});
		self.handle(address, id, seq)
	}

	fn handle(&self, address: Address, id: MessageId, seq: u64) -> Cancellable {
		Cancellable {
			scheduler: Arc::downgrade(&self.inner),
			address,
			id,
			seq,
		}
	}

	/// Cancels every pending send to exactly `address`.
	pub fn cancel(&self, address: impl Addressable) {
		let address = address.address();
		let Some(group) = self.inner.groups.lock().remove(&address) else {
			return;
		};
		tracing::debug!(%address, cancelled = group.len(), "scheduler.cancel_group");
		for pending in group.into_values() {
			pending.cancel.cancel();
		}
	}

	/// Cancels every pending send.
	pub fn cancel_all(&self) {
		let groups = std::mem::take(&mut *self.inner.groups.lock());
		for pending in groups.into_values().flat_map(HashMap::into_values) {
			pending.cancel.cancel();
		}
	}

	/// Number of pending sends to exactly `address`.
	pub fn pending(&self, address: impl Addressable) -> usize {
		self.inner.groups.lock().get(&address.address()).map_or(0, HashMap::len)
	}

	pub fn is_idle(&self) -> bool {
		self.inner.groups.lock().is_empty()
	}
}

/// Delay-bound half of a scheduled send.
#[must_use = "nothing is scheduled until `send` is called"]
pub struct ScheduledSend<'a> {
	scheduler: &'a ActorScheduler,
	delay: Duration,
}

impl ScheduledSend<'_> {
	/// Schedules `message` for `address`. If a send with the same id is
	/// already pending there, nothing new is scheduled and the returned
	/// handle refers to the pending one.
	pub fn send(self, message: impl Into<Message>, address: impl Addressable) -> Cancellable {
		self.scheduler.schedule(self.delay, message.into(), address.address())
	}
}

/// Handle on one pending scheduled send.
#[derive(Debug, Clone)]
pub struct Cancellable {
	scheduler: Weak<SchedulerInner>,
	address: Address,
	id: MessageId,
	seq: u64,
}

impl Cancellable {
	/// Prevents delivery if the send is still pending.
	///
	/// Returns `false` when it already fired or was cancelled; that is a no-op,
	/// not an error.
	pub fn cancel(&self) -> bool {
		let Some(inner) = self.scheduler.upgrade() else {
			return false;
		};
		let Some(pending) = inner.take(self.address, self.id, self.seq) else {
			return false;
		};
		pending.cancel.cancel();
		tracing::debug!(address = %self.address, id = self.id, seq = self.seq, "scheduler.cancel");
		true
	}

	pub fn is_pending(&self) -> bool {
		self.scheduler
			.upgrade()
			.is_some_and(|inner| inner.is_pending(self.address, self.id, self.seq))
	}

	pub const fn address(&self) -> Address {
		self.address
	}

	pub const fn id(&self) -> MessageId {
		self.id
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::RouterConfig;
	use crate::mailbox::MailboxBuilder;

	struct Timer;

	fn setup() -> (ActorScheduler, Arc<Mutex<Vec<MessageId>>>) {
		let registry = Registry::new(&RouterConfig::default());
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		registry
			.register(
				Address::of::<Timer>(),
				MailboxBuilder::new().on_message(move |m| {
					sink.lock().push(m.id());
					Ok(())
				}),
			)
			.unwrap();
		(ActorScheduler::new(registry), seen)
	}

	async fn settle(duration: Duration) {
		tokio::time::sleep(duration).await;
		for _ in 0..8 {
			tokio::task::yield_now().await;
		}
	}

	#[tokio::test(start_paused = true)]
	async fn fires_after_delay_and_clears_group() {
		let (scheduler, seen) = setup();
		let handle = scheduler.after(Duration::from_millis(50)).send(1, Address::of::<Timer>());
		assert!(handle.is_pending());
		assert_eq!(scheduler.pending(Address::of::<Timer>()), 1);

		settle(Duration::from_millis(10)).await;
		assert!(seen.lock().is_empty());

		settle(Duration::from_millis(50)).await;
		assert_eq!(*seen.lock(), vec![1]);
		assert!(!handle.is_pending());
		assert!(scheduler.is_idle());
	}

	#[tokio::test(start_paused = true)]
	async fn duplicate_id_returns_existing_entry() {
		let (scheduler, seen) = setup();
		let first = scheduler.after(Duration::from_millis(50)).send(Message::with_content(5, "a"), Address::of::<Timer>());
		let second = scheduler.after(Duration::from_millis(10)).send(Message::with_content(5, "b"), Address::of::<Timer>());
		assert_eq!(scheduler.pending(Address::of::<Timer>()), 1);

		settle(Duration::from_millis(100)).await;
		assert_eq!(*seen.lock(), vec![5]);
		assert!(!first.cancel());
		assert!(!second.cancel());
	}

	#[tokio::test(start_paused = true)]
	async fn cancel_before_fire_prevents_delivery() {
		let (scheduler, seen) = setup();
		let handle = scheduler.after(Duration::from_millis(50)).send(2, Address::of::<Timer>());
		assert!(handle.cancel());
		assert!(!handle.cancel());

		settle(Duration::from_millis(100)).await;
		assert!(seen.lock().is_empty());
		assert!(scheduler.is_idle());
	}

	#[tokio::test(start_paused = true)]
	async fn group_cancel_drops_every_entry() {
		let (scheduler, seen) = setup();
		let a = scheduler.after(Duration::from_millis(20)).send(1, Address::of::<Timer>());
		let _b = scheduler.after(Duration::from_millis(30)).send(2, Address::of::<Timer>());
		scheduler.cancel(Address::of::<Timer>());
		assert!(!a.is_pending());

		settle(Duration::from_millis(100)).await;
		assert!(seen.lock().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn stale_handle_does_not_cancel_rescheduled_id() {
		let (scheduler, seen) = setup();
		let old = scheduler.after(Duration::from_millis(10)).send(3, Address::of::<Timer>());
		settle(Duration::from_millis(20)).await;

		let fresh = scheduler.after(Duration::from_millis(10)).send(3, Address::of::<Timer>());
		assert!(!old.cancel());
		assert!(fresh.is_pending());

		settle(Duration::from_millis(20)).await;
		assert_eq!(*seen.lock(), vec![3, 3]);
	}
}
