//! Test support: a recording consumer and a runner that drives one actor
//! against mocked collaborators.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_primitives::{Address, Addressable, Message, MessageId};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::actor::Actor;
use crate::config::RouterConfig;
use crate::error::{HandlerResult, Result};
use crate::mailbox::MailboxBuilder;
use crate::router::Router;
use crate::work::WorkContext;

/// Default wait for an expected reply or update.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumer that records every message delivered to its address.
#[derive(Clone)]
pub struct Recorder {
	address: Address,
	seen: Arc<Mutex<Vec<Message>>>,
	notify: Arc<Notify>,
}

impl Recorder {
	/// Registers a recording consumer at `address`.
	pub fn register(router: &Router, address: impl Addressable, context: WorkContext) -> Result<Self> {
		let recorder = Self {
			address: address.address(),
			seen: Arc::new(Mutex::new(Vec::new())),
			notify: Arc::new(Notify::new()),
		};
		router.register_with(recorder.address, recorder.builder(context))?;
		Ok(recorder)
	}

	/// Builder for a consumer feeding this recorder.
	pub fn builder(&self, context: WorkContext) -> MailboxBuilder {
		let seen = Arc::clone(&self.seen);
		let notify = Arc::clone(&self.notify);
		MailboxBuilder::new().work_context(context).on_message(move |message| {
			seen.lock().push(message.clone());
			notify.notify_waiters();
			Ok(())
		})
	}

	pub fn address(&self) -> Address {
		self.address
	}

	pub fn ids(&self) -> Vec<MessageId> {
		self.seen.lock().iter().map(Message::id).collect()
	}

	pub fn messages(&self) -> Vec<Message> {
		self.seen.lock().clone()
	}

	pub fn len(&self) -> usize {
		self.seen.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Waits until at least `count` messages were recorded. Returns `false`
	/// on timeout.
	pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let notified = self.notify.notified();
			if self.len() >= count {
				return true;
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return self.len() >= count;
			}
		}
	}
}

type MockHandler = Arc<dyn Fn(&Router, &Message) -> HandlerResult + Send + Sync>;

/// Runs one actor on a fresh router with its collaborators replaced by mocks.
///
/// Dependents of the target are not spawned; mock the addresses it talks to
/// instead. Every mock runs inline on the sending task.
///
/// ```no_run
/// # use courier_router::{Actor, Address, HandlerResult, Message, Router};
/// # use courier_router::testing::TestRunner;
/// # struct Echo(Router);
/// # impl Actor for Echo {
/// # 	fn on_message(&self, m: &Message) -> HandlerResult {
/// # 		if let Some(to) = m.reply_address() {
/// # 			self.0.try_send(m.id(), &[to])?;
/// # 		}
/// # 		Ok(())
/// # 	}
/// # }
/// # struct Listener;
/// # async fn demo() -> courier_router::Result<()> {
/// let id = TestRunner::new()
/// 	.message(7)
/// 	.reply_to(Address::of::<Listener>())
/// 	.expect_reply(|router| Echo(router.clone()), Address::of::<Listener>(), |reply| reply.id())
/// 	.await?;
/// assert_eq!(id, Some(7));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TestRunner {
	config: RouterConfig,
	timeout: Duration,
	mocks: Vec<(Address, MockHandler)>,
}

impl Default for TestRunner {
	fn default() -> Self {
		Self {
			config: RouterConfig::default(),
			timeout: DEFAULT_EXPECT_TIMEOUT,
			mocks: Vec::new(),
		}
	}
}

impl TestRunner {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn config(mut self, config: RouterConfig) -> Self {
		self.config = config;
		self
	}

	/// How long an expectation waits before yielding `None`.
	#[must_use]
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Stands `handler` in for whatever would live at `address`. The handler
	/// gets the session router so it can answer.
	#[must_use]
	pub fn mock(
		mut self,
		address: impl Addressable,
		handler: impl Fn(&Router, &Message) -> HandlerResult + Send + Sync + 'static,
	) -> Self {
		self.mocks.push((address.address(), Arc::new(handler)));
		self
	}

	/// Starts the message the target will receive.
	pub fn message(self, id: MessageId) -> TestMessage {
		TestMessage {
			runner: self,
			message: Message::new(id),
		}
	}

	fn start(&self) -> Result<Session> {
		let session = Session(Router::new(self.config.clone()));
		for (address, handler) in &self.mocks {
			let router = session.0.clone();
			let handler = Arc::clone(handler);
			session
				.0
				.register(*address, WorkContext::Immediate, move |message| handler(&router, message))?;
		}
		tracing::debug!(mocks = self.mocks.len(), "testing.session.start");
		Ok(session)
	}
}

/// Completes every mailbox of the session router, releasing handlers that
/// hold router clones.
struct Session(Router);

impl Drop for Session {
	fn drop(&mut self) {
		self.0.shutdown();
	}
}

/// Message under construction for a [`TestRunner`] expectation.
#[must_use = "a test message does nothing until an expectation runs"]
pub struct TestMessage {
	runner: TestRunner,
	message: Message,
}

impl TestMessage {
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

	/// Delivers the message to the actor built by `target` and captures the
	/// first message that reaches `at`. `None` if nothing arrives in time.
	pub async fn expect_reply<A, R>(
		self,
		target: impl FnOnce(&Router) -> A,
		at: impl Addressable,
		capture: impl FnOnce(&Message) -> R,
	) -> Result<Option<R>>
	where
		A: Actor,
	{
		let session = self.runner.start()?;
		let router = &session.0;
		let reply = Recorder::register(router, at, WorkContext::Immediate)?;
		let actor = Arc::new(target(router));
		let address = register_target(router, &actor, Arc::new(Handled::default()))?;

		router.send(self.message, &[address]).await?;
		if !reply.wait_for(1, self.runner.timeout).await {
			tracing::debug!(%address, at = %reply.address(), "testing.expect_reply.timeout");
			return Ok(None);
		}
		Ok(reply.messages().first().map(capture))
	}

	/// Delivers the message to the actor built by `target` and reads its state
	/// once the handler returned. `None` if it was not handled in time.
	pub async fn expect_update<A, R>(self, target: impl FnOnce(&Router) -> A, read: impl FnOnce(&A) -> R) -> Result<Option<R>>
	where
		A: Actor,
	{
		let session = self.runner.start()?;
		let router = &session.0;
		let actor = Arc::new(target(router));
		let handled = Arc::new(Handled::default());
		let address = register_target(router, &actor, Arc::clone(&handled))?;

		router.send(self.message, &[address]).await?;
		if !handled.wait(self.runner.timeout).await {
			tracing::debug!(%address, "testing.expect_update.timeout");
			return Ok(None);
		}
		Ok(Some(read(&actor)))
	}
}

#[derive(Default)]
struct Handled {
	count: AtomicUsize,
	notify: Notify,
}

impl Handled {
	async fn wait(&self, timeout: Duration) -> bool {
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let notified = self.notify.notified();
			if self.count.load(Ordering::SeqCst) > 0 {
				return true;
			}
			if tokio::time::timeout_at(deadline, notified).await.is_err() {
				return self.count.load(Ordering::SeqCst) > 0;
			}
		}
	}
}

/// Registers `actor` at its own address without spawning dependents.
fn register_target<A: Actor>(router: &Router, actor: &Arc<A>, handled: Arc<Handled>) -> Result<Address> {
	let address = actor.address();
	let handler = Arc::clone(actor);
	let closing = Arc::clone(actor);
	router.register_with(
		address,
		MailboxBuilder::new()
			.work_context(actor.work_context())
			.on_message(move |message| {
				let result = handler.on_message(message);
				handled.count.fetch_add(1, Ordering::SeqCst);
				handled.notify.notify_waiters();
				result
			})
			.on_closed(move || closing.on_unregister()),
	)?;
	Ok(address)
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicI32;

	use pretty_assertions::assert_eq;

	use super::*;

	struct Directory;
	struct Listener;

	/// Looks a name up in the directory and greets the reply address.
	struct Greeter {
		router: Router,
		reply_to: Mutex<Option<Address>>,
	}

	const LOOKUP: MessageId = 1;
	const FOUND: MessageId = 2;
	const GREETING: MessageId = 3;

	impl Actor for Greeter {
		fn on_message(&self, message: &Message) -> HandlerResult {
			match message.id() {
				LOOKUP => {
					*self.reply_to.lock() = message.reply_address();
					let query = Message::new(LOOKUP).reply_to(Address::of::<Self>());
					self.router.try_send(query, &[Address::of::<Directory>()])?;
				}
				FOUND => {
					let name = message.content::<String>().cloned().unwrap_or_default();
					let reply_to = *self.reply_to.lock();
					if let Some(to) = reply_to {
						self.router
							.try_send(Message::with_content(GREETING, format!("hello {name}")), &[to])?;
					}
				}
				_ => {}
			}
			Ok(())
		}
	}

	#[derive(Default)]
	struct Tally {
		total: AtomicI32,
	}

	impl Actor for Tally {
		fn on_message(&self, message: &Message) -> HandlerResult {
			self.total.fetch_add(message.content::<i32>().copied().unwrap_or(1), Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn reply_flows_through_mocked_collaborator() {
		let greeting = TestRunner::new()
			.mock(Address::of::<Directory>(), |router, query| {
				if let Some(to) = query.reply_address() {
					router.try_send(Message::with_content(FOUND, String::from("alice")), &[to])?;
				}
				Ok(())
			})
			.message(LOOKUP)
			.reply_to(Address::of::<Listener>())
			.expect_reply(
				|router| Greeter {
					router: router.clone(),
					reply_to: Mutex::new(None),
				},
				Address::of::<Listener>(),
				|reply| reply.content::<String>().cloned(),
			)
			.await
			.unwrap();
		assert_eq!(greeting, Some(Some("hello alice".to_owned())));
	}

	#[tokio::test]
	async fn update_reads_target_state_after_handling() {
		let total = TestRunner::new()
			.message(9)
			.content(5_i32)
			.expect_update(|_| Tally::default(), |tally| tally.total.load(Ordering::SeqCst))
			.await
			.unwrap();
		assert_eq!(total, Some(5));
	}

	#[tokio::test(start_paused = true)]
	async fn missing_reply_times_out() {
		let reply = TestRunner::new()
			.timeout(Duration::from_millis(200))
			.message(LOOKUP)
			.reply_to(Address::of::<Listener>())
			.expect_reply(
				|router| Greeter {
					router: router.clone(),
					reply_to: Mutex::new(None),
				},
				Address::of::<Listener>(),
				Message::id,
			)
			.await
			.unwrap();
		assert_eq!(reply, None);
	}
}
