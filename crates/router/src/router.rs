use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use courier_primitives::{Address, Addressable, Message, MessageId};

use crate::actor::{self, Actor};
use crate::config::RouterConfig;
use crate::error::{HandlerResult, Result};
use crate::mailbox::MailboxBuilder;
use crate::registry::Registry;
use crate::scheduler::{ActorScheduler, Cancellable};
use crate::spawn::{SpawnCatalog, SpawnTracker};
use crate::work::WorkContext;

struct RouterInner {
	config: RouterConfig,
	registry: Registry,
	scheduler: ActorScheduler,
	spawner: SpawnTracker,
}

/// Router instance: registry, scheduler and spawn tracker behind one handle.
///
/// Cloning is cheap and every clone addresses the same instance.
#[derive(Clone)]
pub struct Router {
	inner: Arc<RouterInner>,
}

impl Default for Router {
	fn default() -> Self {
		Self::new(RouterConfig::default())
	}
}

impl std::fmt::Debug for Router {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Router")
			.field("config", &self.inner.config)
			.field("mailboxes", &self.inner.registry.len())
			.finish_non_exhaustive()
	}
}

impl Router {
	pub fn new(config: RouterConfig) -> Self {
		Self::with_catalog(config, SpawnCatalog::new())
	}

	/// Creates a router that resolves [`Dependent::named`](crate::Dependent::named)
	/// through `catalog`.
	pub fn with_catalog(config: RouterConfig, catalog: SpawnCatalog) -> Self {
		let registry = Registry::new(&config);
		let scheduler = ActorScheduler::new(registry.clone());
		let spawner = SpawnTracker::new(registry.clone(), catalog);
		Self {
			inner: Arc::new(RouterInner {
				config,
				registry,
				scheduler,
				spawner,
			}),
		}
	}

	pub fn config(&self) -> &RouterConfig {
		&self.inner.config
	}

	/// Registers `on_message` at `address`, running on `context`.
	pub fn register(
		&self,
		address: impl Addressable,
		context: WorkContext,
		on_message: impl Fn(&Message) -> HandlerResult + Send + Sync + 'static,
	) -> Result<()> {
		self.register_with(address, MailboxBuilder::new().work_context(context).on_message(on_message))
	}

	/// Registers a fully described consumer at `address`.
	pub fn register_with(&self, address: impl Addressable, builder: MailboxBuilder) -> Result<()> {
		self.inner.registry.register(address.address(), builder)
	}

	/// Registers `actor` at its own address and spawns its dependents.
	pub fn register_actor<A: Actor>(&self, actor: Arc<A>) -> Result<Address> {
		let address = actor.address();
		let dependents = actor.dependents();
		self.inner.registry.register(address, actor::mailbox_for(actor))?;
		self.inner.spawner.spawn_for(address, dependents);
		Ok(address)
	}

	/// Releases the dependents of `address` and completes its mailbox.
	/// Pending scheduled sends are kept; see [`Router::finalize`].
	///
	/// Returns `false` if nothing was registered at exactly `address`.
	pub fn unregister(&self, address: impl Addressable) -> bool {
		let address = address.address();
		self.inner.spawner.release_for(address);
		self.inner.spawner.forget(address);
		self.inner.registry.unregister(address)
	}

	/// Unregisters `address` and cancels its pending scheduled sends.
	pub fn finalize(&self, address: impl Addressable) -> bool {
		let address = address.address();
		let removed = self.unregister(address);
		self.inner.scheduler.cancel(address);
		removed
	}

	/// Detaches the consumer at `address` while new messages keep buffering
	/// for the next registration.
	pub fn postpone(&self, address: impl Addressable) {
		let address = address.address();
		if self.inner.config.postpone_disabled {
			tracing::trace!(%address, "router.postpone.disabled");
			self.unregister(address);
			return;
		}
		self.inner.spawner.release_for(address);
		self.inner.registry.postpone(address);
	}

	/// Sends `message` to every listed address. Addresses with no mailbox are
	/// skipped; waits while a target mailbox is full.
	pub async fn send(&self, message: impl Into<Message>, addresses: &[Address]) -> Result<()> {
		self.inner.registry.send(&message.into(), addresses).await
	}

	/// Sends a content-less message.
	pub async fn send_id(&self, id: MessageId, addresses: &[Address]) -> Result<()> {
		self.send(Message::new(id), addresses).await
	}

	/// Non-waiting [`Router::send`]. A full mailbox drops the message.
	pub fn try_send(&self, message: impl Into<Message>, addresses: &[Address]) -> Result<()> {
		self.inner.registry.try_send(&message.into(), addresses)
	}

	/// Starts building a message with the given id.
	pub fn message(&self, id: MessageId) -> MessageBuilder<'_> {
		MessageBuilder {
			router: self,
			message: Message::new(id),
			addresses: Vec::new(),
		}
	}

	/// Returns true when a consumer is attached at exactly `address`.
	pub fn is_registered(&self, address: impl Addressable) -> bool {
		self.inner.registry.is_registered(address.address())
	}

	pub fn registry(&self) -> &Registry {
		&self.inner.registry
	}

	pub fn scheduler(&self) -> &ActorScheduler {
		&self.inner.scheduler
	}

	pub fn spawn_tracker(&self) -> &SpawnTracker {
		&self.inner.spawner
	}

	/// Cancels every scheduled send and completes every mailbox.
	pub fn shutdown(&self) {
		tracing::debug!(mailboxes = self.inner.registry.len(), "router.shutdown");
		self.inner.scheduler.cancel_all();
		self.inner.spawner.clear();
		self.inner.registry.clear();
	}
}

/// Fluent message construction bound to a router.
#[must_use = "a message builder does nothing until sent"]
pub struct MessageBuilder<'a> {
	router: &'a Router,
	message: Message,
	addresses: Vec<Address>,
}

impl MessageBuilder<'_> {
	pub fn content<T: Any + Send + Sync>(mut self, content: T) -> Self {
		let reply_to = self.message.reply_address();
		self.message = Message::with_content(self.message.id(), content);
		if let Some(address) = reply_to {
			self.message = self.message.reply_to(address);
		}
		self
	}

	pub fn reply_to(mut self, address: impl Addressable) -> Self {
		self.message = self.message.reply_to(address.address());
		self
	}

	/// Adds a destination.
	pub fn to(mut self, address: impl Addressable) -> Self {
		self.addresses.push(address.address());
		self
	}

	pub fn build(self) -> Message {
		self.message
	}

	pub async fn send(self) -> Result<()> {
		self.router.inner.registry.send(&self.message, &self.addresses).await
	}

	pub fn try_send(self) -> Result<()> {
		self.router.inner.registry.try_send(&self.message, &self.addresses)
	}

	/// Schedules the message to every destination after `delay`.
	pub fn schedule(self, delay: Duration) -> Vec<Cancellable> {
		let scheduler = &self.router.inner.scheduler;
		self.addresses
			.iter()
			.map(|address| scheduler.after(delay).send(self.message.clone(), *address))
			.collect()
	}
}
