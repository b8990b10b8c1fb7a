//! Address to mailbox registry.
//!
//! Mutations (register, unregister, postpone) serialize on one mutex and
//! publish a fresh snapshot of the map. Lookups read the current snapshot
//! without locking, so `send` never observes a half-updated entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use courier_primitives::{Address, Message};
use futures::future::join_all;
use parking_lot::Mutex;

use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::mailbox::{Mailbox, MailboxBuilder, PushError, PushOutcome, Subscription};
use crate::work::Spawner;

struct Entry {
	mailbox: Mailbox,
	subscription: Option<Subscription>,
}

type Snapshot = HashMap<Address, Arc<Entry>>;

struct RegistryInner {
	capacity: usize,
	entries: ArcSwap<Snapshot>,
	write: Mutex<()>,
	spawner: Spawner,
	drops: AtomicU64,
}

/// Concurrent mapping from address to mailbox and consumer subscription.
///
/// Holds at most one live mailbox per address.
#[derive(Clone)]
pub struct Registry {
	inner: Arc<RegistryInner>,
}

impl Registry {
	pub fn new(config: &RouterConfig) -> Self {
		Self {
			inner: Arc::new(RegistryInner {
				capacity: config.mailbox_capacity,
				entries: ArcSwap::from_pointee(HashMap::new()),
				write: Mutex::new(()),
				spawner: Spawner::new(config.fallback_worker_threads),
				drops: AtomicU64::new(0),
			}),
		}
	}

	/// Task launcher for consumers of this registry, shared with the scheduler.
	pub(crate) fn spawner(&self) -> &Spawner {
		&self.inner.spawner
	}

	/// Attaches a consumer to `address`, creating the mailbox if needed.
	///
	/// Messages already buffered at `address` are delivered to the new
	/// consumer in order.
	pub fn register(&self, address: Address, builder: MailboxBuilder) -> Result<()> {
		let mailbox = self.attach(address, builder)?;
		mailbox.drain_immediate();
		Ok(())
	}

	/// Registers without draining immediate consumers. Callers holding other
	/// locks drain the returned mailbox once those are released.
	pub(crate) fn attach(&self, address: Address, builder: MailboxBuilder) -> Result<Mailbox> {
		let capacity = builder.requested_capacity().unwrap_or(self.inner.capacity);
		let consumer = builder.build(address)?;

		let _write = self.inner.write.lock();
		let current = self.inner.entries.load_full();
		let (mailbox, carried_over) = match current.get(&address) {
			Some(entry) => {
				if let Some(previous) = &entry.subscription {
					previous.dispose();
				}
				(entry.mailbox.clone(), true)
			}
			None => (Mailbox::new(address, capacity), false),
		};
		let subscription = mailbox.attach(consumer, &self.inner.spawner);
		tracing::debug!(
			%address,
			generation = subscription.generation(),
			context = subscription.context().as_str(),
			carried_over,
			buffered = mailbox.len(),
			"router.register"
		);

		let mut next = (*current).clone();
		next.insert(
			address,
			Arc::new(Entry {
				mailbox: mailbox.clone(),
				subscription: Some(subscription),
			}),
		);
		self.inner.entries.store(Arc::new(next));
		Ok(mailbox)
	}

	/// Completes and removes the mailbox at exactly `address`.
	///
	/// Returns `false` when nothing was registered there; that is not an error.
	pub fn unregister(&self, address: Address) -> bool {
		let removed = {
			let _write = self.inner.write.lock();
			let current = self.inner.entries.load_full();
			if !current.contains_key(&address) {
				None
			} else {
				let mut next = (*current).clone();
				let removed = next.remove(&address);
				self.inner.entries.store(Arc::new(next));
				removed
			}
		};
		let Some(entry) = removed else {
			tracing::trace!(%address, "router.unregister.ignored");
			return false;
		};
		tracing::debug!(%address, "router.unregister");
		complete(&entry);
		true
	}

	/// Completes the mailbox at `address` and installs an empty, consumer-less
	/// one that buffers until the next `register`.
	pub fn postpone(&self, address: Address) {
		let previous = {
			let _write = self.inner.write.lock();
			let current = self.inner.entries.load_full();
			let mut next = (*current).clone();
			let previous = next.remove(&address);
			let capacity = previous.as_ref().map_or(self.inner.capacity, |e| e.mailbox.capacity());
			next.insert(
				address,
				Arc::new(Entry {
					mailbox: Mailbox::new(address, capacity),
					subscription: None,
				}),
			);
			self.inner.entries.store(Arc::new(next));
			previous
		};
		tracing::debug!(%address, replaced = previous.is_some(), "router.postpone");
		if let Some(entry) = previous {
			complete(&entry);
		}
	}

	/// Unregisters every address.
	pub fn clear(&self) {
		let drained = {
			let _write = self.inner.write.lock();
			self.inner.entries.swap(Arc::new(HashMap::new()))
		};
		for entry in drained.values() {
			complete(entry);
		}
	}

	/// Resolves `address` to at most one mailbox: the exact key first, then
	/// the type fallback of an instance address.
	pub fn lookup(&self, address: Address) -> Option<Mailbox> {
		let snapshot = self.inner.entries.load();
		address.candidates().find_map(|key| snapshot.get(&key).map(|e| e.mailbox.clone()))
	}

	/// Returns true when a mailbox (live or postponed) exists at exactly `address`.
	pub fn contains(&self, address: Address) -> bool {
		self.inner.entries.load().contains_key(&address)
	}

	/// Returns true when a consumer is attached at exactly `address`.
	pub fn is_registered(&self, address: Address) -> bool {
		self.inner.entries.load().get(&address).is_some_and(|e| e.subscription.is_some())
	}

	pub fn addresses(&self) -> Vec<Address> {
		self.inner.entries.load().keys().copied().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.entries.load().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Delivers `message` to every listed address that has a mailbox.
	///
	/// Addresses with no mailbox are skipped. Each address is fed
	/// independently, so a full mailbox only delays its own enqueue.
	pub async fn send(&self, message: &Message, addresses: &[Address]) -> Result<()> {
		let targets = self.resolve(message, addresses)?;
		join_all(targets.into_iter().map(|(address, mailbox)| async move {
			let outcome = mailbox.push(message.clone()).await;
			log_push(address, message, outcome);
		}))
		.await;
		Ok(())
	}

	/// Non-waiting [`Registry::send`]: a full mailbox drops the message.
	pub fn try_send(&self, message: &Message, addresses: &[Address]) -> Result<()> {
		for (address, mailbox) in self.resolve(message, addresses)? {
			let outcome = mailbox.try_push(message.clone());
			if let Err(PushError::Full) = outcome {
				let count = self.inner.drops.fetch_add(1, Ordering::Relaxed);
				if count % 1024 == 0 {
					tracing::warn!(%address, id = message.id(), drops = count + 1, "router.send.full");
				}
				continue;
			}
			log_push(address, message, outcome);
		}
		Ok(())
	}

	fn resolve(&self, message: &Message, addresses: &[Address]) -> Result<Vec<(Address, Mailbox)>> {
		if addresses.is_empty() {
			return Err(RouterError::NoAddressesSpecified { id: message.id() });
		}
		let snapshot = self.inner.entries.load();
		Ok(addresses
			.iter()
			.filter_map(|address| {
				let found = address.candidates().find_map(|key| snapshot.get(&key).map(|e| e.mailbox.clone()));
				if found.is_none() {
					tracing::trace!(%address, id = message.id(), "router.send.ignored");
				}
				found.map(|mailbox| (*address, mailbox))
			})
			.collect())
	}
}

fn complete(entry: &Entry) {
	if let Some(subscription) = &entry.subscription {
		subscription.dispose();
	}
	if let Some(consumer) = entry.mailbox.close() {
		consumer.closed();
	}
}

fn log_push(address: Address, message: &Message, outcome: std::result::Result<PushOutcome, PushError>) {
	match outcome {
		Ok(PushOutcome::Enqueued) => {}
		Ok(PushOutcome::ReplacedOldest) => {
			tracing::debug!(%address, id = message.id(), "router.mailbox.evicted_oldest");
		}
		Err(err) => {
			tracing::trace!(%address, id = message.id(), ?err, "router.send.rejected");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use courier_primitives::MessageId;
	use pretty_assertions::assert_eq;

	use super::*;
	use crate::work::WorkContext;

	struct Counter;
	struct Logger;

	fn recorder() -> (MailboxBuilder, Arc<Mutex<Vec<MessageId>>>) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		let builder = MailboxBuilder::new().work_context(WorkContext::Immediate).on_message(move |m| {
			sink.lock().push(m.id());
			Ok(())
		});
		(builder, seen)
	}

	fn registry() -> Registry {
		Registry::new(&RouterConfig::default())
	}

	#[tokio::test]
	async fn register_then_send_delivers_in_order() {
		let registry = registry();
		let (builder, seen) = recorder();
		registry.register(Address::of::<Counter>(), builder).unwrap();

		for id in 1..=3 {
			registry.send(&Message::new(id), &[Address::of::<Counter>()]).await.unwrap();
		}
		assert_eq!(*seen.lock(), vec![1, 2, 3]);
	}

	#[tokio::test]
	async fn send_without_addresses_fails() {
		let err = registry().send(&Message::new(9), &[]).await.unwrap_err();
		assert_eq!(err, RouterError::NoAddressesSpecified { id: 9 });
	}

	#[tokio::test]
	async fn send_to_unknown_address_is_ignored() {
		let registry = registry();
		registry.send(&Message::new(1), &[Address::of::<Logger>()]).await.unwrap();
		assert!(registry.is_empty());
	}

	#[tokio::test]
	async fn instance_address_falls_back_to_type_mailbox() {
		let registry = registry();
		let (builder, seen) = recorder();
		registry.register(Address::of::<Counter>(), builder).unwrap();

		let instance = Address::new_instance::<Counter>();
		registry.send(&Message::new(4), &[instance]).await.unwrap();
		assert_eq!(*seen.lock(), vec![4]);

		let (own, own_seen) = recorder();
		registry.register(instance, own).unwrap();
		registry.send(&Message::new(5), &[instance]).await.unwrap();
		assert_eq!(*own_seen.lock(), vec![5]);
		assert_eq!(*seen.lock(), vec![4]);
	}

	#[tokio::test]
	async fn type_address_does_not_fan_out_to_instances() {
		let registry = registry();
		let (builder, seen) = recorder();
		registry.register(Address::new_instance::<Counter>(), builder).unwrap();

		registry.send(&Message::new(1), &[Address::of::<Counter>()]).await.unwrap();
		assert!(seen.lock().is_empty());
	}

	#[tokio::test]
	async fn unregister_completes_and_is_idempotent() {
		let registry = registry();
		let closed = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&closed);
		let (builder, seen) = recorder();
		let builder = builder.on_closed(move || {
			counter.fetch_add(1, Ordering::SeqCst);
		});
		registry.register(Address::of::<Counter>(), builder).unwrap();

		assert!(registry.unregister(Address::of::<Counter>()));
		assert!(!registry.unregister(Address::of::<Counter>()));
		assert_eq!(closed.load(Ordering::SeqCst), 1);

		registry.send(&Message::new(1), &[Address::of::<Counter>()]).await.unwrap();
		assert!(seen.lock().is_empty());
	}

	#[test]
	fn unregistering_instance_leaves_type_mailbox() {
		let registry = registry();
		let (builder, _) = recorder();
		registry.register(Address::of::<Counter>(), builder).unwrap();

		assert!(!registry.unregister(Address::new_instance::<Counter>()));
		assert!(registry.is_registered(Address::of::<Counter>()));
	}

	#[tokio::test]
	async fn postponed_messages_replay_on_register() {
		let registry = registry();
		let (first, first_seen) = recorder();
		registry.register(Address::of::<Counter>(), first).unwrap();

		registry.postpone(Address::of::<Counter>());
		assert!(registry.contains(Address::of::<Counter>()));
		assert!(!registry.is_registered(Address::of::<Counter>()));
		registry.send(&Message::new(7), &[Address::of::<Counter>()]).await.unwrap();
		registry.send(&Message::new(8), &[Address::of::<Counter>()]).await.unwrap();
		assert!(first_seen.lock().is_empty());

		let (second, second_seen) = recorder();
		registry.register(Address::of::<Counter>(), second).unwrap();
		assert_eq!(*second_seen.lock(), vec![7, 8]);
	}

	#[tokio::test]
	async fn postponed_then_unregistered_drops_buffer() {
		let registry = registry();
		registry.postpone(Address::of::<Counter>());
		registry.send(&Message::new(7), &[Address::of::<Counter>()]).await.unwrap();
		assert!(registry.unregister(Address::of::<Counter>()));

		let (builder, seen) = recorder();
		registry.register(Address::of::<Counter>(), builder).unwrap();
		assert!(seen.lock().is_empty());
	}

	#[tokio::test]
	async fn handler_failure_does_not_stop_siblings() {
		let registry = registry();
		let failing = MailboxBuilder::new().on_message(|_| Err("nope".into()));
		registry.register(Address::of::<Logger>(), failing).unwrap();
		let (builder, seen) = recorder();
		registry.register(Address::of::<Counter>(), builder).unwrap();

		registry
			.send(&Message::new(3), &[Address::of::<Logger>(), Address::of::<Counter>()])
			.await
			.unwrap();
		assert_eq!(*seen.lock(), vec![3]);
	}

	#[test]
	fn register_without_handler_is_rejected() {
		let err = registry().register(Address::of::<Counter>(), MailboxBuilder::new()).unwrap_err();
		assert!(matches!(err, RouterError::MissingHandler { .. }));
	}

	#[test]
	fn try_send_on_detached_full_mailbox_evicts() {
		let registry = Registry::new(&RouterConfig::default().mailbox_capacity(2));
		registry.postpone(Address::of::<Counter>());
		for id in 1..=4 {
			registry.try_send(&Message::new(id), &[Address::of::<Counter>()]).unwrap();
		}
		let mailbox = registry.lookup(Address::of::<Counter>()).unwrap();
		assert_eq!(mailbox.len(), 2);

		let (builder, seen) = recorder();
		registry.register(Address::of::<Counter>(), builder).unwrap();
		assert_eq!(*seen.lock(), vec![3, 4]);
	}

	#[test]
	fn clear_completes_everything() {
		let registry = registry();
		for address in [Address::of::<Counter>(), Address::of::<Logger>()] {
			let (builder, _) = recorder();
			registry.register(address, builder).unwrap();
		}
		assert_eq!(registry.len(), 2);
		registry.clear();
		assert!(registry.is_empty());
	}
}
