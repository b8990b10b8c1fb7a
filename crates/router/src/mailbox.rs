use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_primitives::{Address, Message};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerError, HandlerResult, Result, RouterError, panic_message};
use crate::work::{Spawner, WorkContext};

/// Replay capacity of a mailbox when none is configured.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10;

pub type MessageHandler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Address, &HandlerError) + Send + Sync>;
pub type ClosedHandler = Arc<dyn Fn() + Send + Sync>;

/// Outcome from enqueueing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
	/// Message was enqueued without replacement.
	Enqueued,
	/// No consumer was attached and the buffer was full, so the oldest
	/// buffered message was evicted.
	ReplacedOldest,
}

/// Mailbox enqueue error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
	/// Mailbox was completed by unregister.
	Closed,
	/// Buffer is full and the non-waiting variant was used.
	Full,
}

/// Describes the consumer side of a mailbox.
///
/// `on_message` is mandatory. `on_error` defaults to logging the failure and
/// `on_closed` defaults to doing nothing.
pub struct MailboxBuilder {
	context: WorkContext,
	capacity: Option<usize>,
	on_message: Option<MessageHandler>,
	on_error: Option<ErrorHandler>,
	on_closed: Option<ClosedHandler>,
}

impl Default for MailboxBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl MailboxBuilder {
	pub fn new() -> Self {
		Self {
			context: WorkContext::Immediate,
			capacity: None,
			on_message: None,
			on_error: None,
			on_closed: None,
		}
	}

	/// Sets where the consumer runs.
	#[must_use]
	pub fn work_context(mut self, context: WorkContext) -> Self {
		self.context = context;
		self
	}

	/// Overrides the buffer capacity of a freshly created mailbox. An existing
	/// mailbox keeps its capacity.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	#[must_use]
	pub fn capacity(mut self, capacity: usize) -> Self {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		self.capacity = Some(capacity);
		self
	}

	#[must_use]
	pub fn on_message(mut self, handler: impl Fn(&Message) -> HandlerResult + Send + Sync + 'static) -> Self {
		self.on_message = Some(Arc::new(handler));
		self
	}

	#[must_use]
	pub fn on_error(mut self, handler: impl Fn(&Address, &HandlerError) + Send + Sync + 'static) -> Self {
		self.on_error = Some(Arc::new(handler));
		self
	}

	/// Sets the callback fired once when the mailbox is completed.
	#[must_use]
	pub fn on_closed(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
		self.on_closed = Some(Arc::new(handler));
		self
	}

	pub(crate) fn requested_capacity(&self) -> Option<usize> {
		self.capacity
	}

	pub(crate) fn build(self, address: Address) -> Result<Consumer> {
		let Some(on_message) = self.on_message else {
			return Err(RouterError::MissingHandler {
				address: address.to_string(),
			});
		};
		Ok(Consumer {
			address,
			context: self.context,
			on_message,
			on_error: self.on_error.unwrap_or_else(|| Arc::new(log_handler_error) as ErrorHandler),
			on_closed: self.on_closed,
		})
	}
}

fn log_handler_error(address: &Address, err: &HandlerError) {
	tracing::error!(%address, error = %err, "router.handler.failed");
}

/// Built consumer attached to one mailbox.
pub(crate) struct Consumer {
	address: Address,
	context: WorkContext,
	on_message: MessageHandler,
	on_error: ErrorHandler,
	on_closed: Option<ClosedHandler>,
}

impl Consumer {
	/// Runs the handler for one message, isolating failures.
	fn deliver(&self, message: Message) {
		tracing::trace!(address = %self.address, id = message.id(), "router.deliver");
		let err = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.on_message)(&message))) {
			Ok(Ok(())) => return,
			Ok(Err(err)) => err,
			Err(payload) => HandlerError::Panicked(panic_message(payload)),
		};
		if std::panic::catch_unwind(AssertUnwindSafe(|| (self.on_error)(&self.address, &err))).is_err() {
			tracing::error!(address = %self.address, error = %err, "router.on_error.panicked");
		}
	}

	/// Fires the completion callback.
	pub(crate) fn closed(&self) {
		let Some(on_closed) = &self.on_closed else {
			return;
		};
		if std::panic::catch_unwind(AssertUnwindSafe(|| on_closed())).is_err() {
			tracing::error!(address = %self.address, "router.on_closed.panicked");
		}
	}

	pub(crate) const fn context(&self) -> WorkContext {
		self.context
	}
}

struct Attached {
	consumer: Arc<Consumer>,
	generation: u64,
	stop: CancellationToken,
}

struct MailboxState {
	queue: VecDeque<Message>,
	closed: bool,
	/// A popped message is still inside a handler.
	in_flight: bool,
	generations: u64,
	consumer: Option<Attached>,
}

impl MailboxState {
	fn offer(&mut self, message: Message, capacity: usize) -> std::result::Result<PushOutcome, (PushError, Message)> {
		if self.closed {
			return Err((PushError::Closed, message));
		}
		if self.queue.len() < capacity {
			self.queue.push_back(message);
			return Ok(PushOutcome::Enqueued);
		}
		if self.consumer.is_none() {
			let _ = self.queue.pop_front();
			self.queue.push_back(message);
			return Ok(PushOutcome::ReplacedOldest);
		}
		Err((PushError::Full, message))
	}

	fn immediate_consumer(&self) -> Option<Arc<Consumer>> {
		self.consumer
			.as_ref()
			.filter(|a| a.consumer.context == WorkContext::Immediate && !a.stop.is_cancelled())
			.map(|a| Arc::clone(&a.consumer))
	}

	/// Pops the next message for the consumer of `generation`, unless another
	/// delivery is still running.
	fn take_for(&mut self, generation: u64) -> Option<Message> {
		let current = self.consumer.as_ref().is_some_and(|a| a.generation == generation);
		if self.closed || !current || self.in_flight {
			return None;
		}
		let message = self.queue.pop_front()?;
		self.in_flight = true;
		Some(message)
	}
}

struct MailboxInner {
	address: Address,
	capacity: usize,
	state: Mutex<MailboxState>,
	drain: Mutex<()>,
	notify_recv: Notify,
	notify_send: Notify,
}

/// Handle on the consumer attachment of a mailbox.
///
/// Disposing it detaches the consumer; queued messages stay buffered.
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
	generation: u64,
	stop: CancellationToken,
	context: WorkContext,
}

impl Subscription {
	pub(crate) fn dispose(&self) {
		self.stop.cancel();
	}

	pub(crate) const fn generation(&self) -> u64 {
		self.generation
	}

	pub(crate) const fn context(&self) -> WorkContext {
		self.context
	}
}

/// Ordered, bounded, single-consumer message queue bound to one address.
///
/// While no consumer is attached the buffer keeps the newest `capacity`
/// messages for replay. Once a consumer is attached, producers wait for room.
/// At most one message is inside a handler at a time, even across a consumer
/// replacement: the new consumer starts after the old one returns.
#[derive(Clone)]
pub struct Mailbox {
	inner: Arc<MailboxInner>,
}

impl fmt::Debug for Mailbox {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Mailbox")
			.field("address", &self.inner.address)
			.field("capacity", &self.inner.capacity)
			.finish_non_exhaustive()
	}
}

impl Mailbox {
	/// Creates an empty mailbox with no consumer.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	pub(crate) fn new(address: Address, capacity: usize) -> Self {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		Self {
			inner: Arc::new(MailboxInner {
				address,
				capacity,
				state: Mutex::new(MailboxState {
					queue: VecDeque::with_capacity(capacity),
					closed: false,
					in_flight: false,
					generations: 0,
					consumer: None,
				}),
				drain: Mutex::new(()),
				notify_recv: Notify::new(),
				notify_send: Notify::new(),
			}),
		}
	}

	pub fn address(&self) -> Address {
		self.inner.address
	}

	pub fn capacity(&self) -> usize {
		self.inner.capacity
	}

	/// Number of buffered, undelivered messages.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().closed
	}

	pub fn has_consumer(&self) -> bool {
		self.inner.state.lock().consumer.is_some()
	}

	/// Attaches `consumer`, detaching any previous one. Buffered messages are
	/// carried over to the new consumer.
	///
	/// Immediate consumers are not drained here; callers run
	/// [`Mailbox::drain_immediate`] once they hold no locks.
	pub(crate) fn attach(&self, consumer: Consumer, spawner: &Spawner) -> Subscription {
		let stop = CancellationToken::new();
		let context = consumer.context();
		let consumer = Arc::new(consumer);
		let (generation, previous) = {
			let mut state = self.inner.state.lock();
			state.generations += 1;
			let generation = state.generations;
			let previous = state.consumer.replace(Attached {
				consumer: Arc::clone(&consumer),
				generation,
				stop: stop.clone(),
			});
			(generation, previous)
		};
		if let Some(previous) = previous {
			tracing::debug!(
				address = %self.inner.address,
				old = previous.generation,
				new = generation,
				"router.mailbox.consumer_replaced"
			);
			previous.stop.cancel();
		}

		if let WorkContext::Spawned(class) = context {
			let _ = spawner.spawn(class, run_consumer(self.clone(), consumer, generation, stop.clone()));
		}
		Subscription {
			generation,
			stop,
			context,
		}
	}

	/// Completes the mailbox: rejects further messages, discards the buffer
	/// and detaches the consumer, which is returned so the caller can fire
	/// its completion callback.
	pub(crate) fn close(&self) -> Option<Arc<Consumer>> {
		let (attached, dropped) = {
			let mut state = self.inner.state.lock();
			state.closed = true;
			let dropped = state.queue.len();
			state.queue.clear();
			(state.consumer.take(), dropped)
		};
		self.inner.notify_recv.notify_waiters();
		self.inner.notify_send.notify_waiters();
		if dropped > 0 {
			tracing::debug!(address = %self.inner.address, dropped, "router.mailbox.discarded");
		}
		attached.map(|a| {
			a.stop.cancel();
			a.consumer
		})
	}

	/// Enqueues `message`, waiting for room while a consumer is attached and
	/// the buffer is full.
	pub async fn push(&self, message: Message) -> std::result::Result<PushOutcome, PushError> {
		let mut message = message;
		let outcome = loop {
			let notified = self.inner.notify_send.notified();
			{
				let mut state = self.inner.state.lock();
				match state.offer(message, self.inner.capacity) {
					Ok(outcome) => break outcome,
					Err((PushError::Full, rejected)) => message = rejected,
					Err((err, _)) => return Err(err),
				}
			}
			tracing::trace!(address = %self.inner.address, "router.mailbox.backpressure");
			notified.await;
		};
		self.after_enqueue();
		Ok(outcome)
	}

	/// Non-waiting enqueue. Returns `Full` instead of applying backpressure.
	pub fn try_push(&self, message: Message) -> std::result::Result<PushOutcome, PushError> {
		let outcome = self.inner.state.lock().offer(message, self.inner.capacity).map_err(|(err, _)| err)?;
		self.after_enqueue();
		Ok(outcome)
	}

	fn after_enqueue(&self) {
		self.inner.notify_recv.notify_one();
		self.drain_immediate();
	}

	/// Delivers buffered messages inline if an immediate consumer is attached.
	///
	/// One drainer at a time; a caller that loses the race leaves its message
	/// to the current drainer, which re-checks the queue after releasing.
	pub(crate) fn drain_immediate(&self) {
		loop {
			let Some(guard) = self.inner.drain.try_lock() else {
				return;
			};
			loop {
				let next = {
					let mut state = self.inner.state.lock();
					match state.immediate_consumer() {
						Some(consumer) => {
							let generation = state.consumer.as_ref().map_or(0, |a| a.generation);
							state.take_for(generation).map(|m| (consumer, m))
						}
						None => None,
					}
				};
				let Some((consumer, message)) = next else {
					break;
				};
				self.inner.notify_send.notify_one();
				consumer.deliver(message);
				self.end_delivery();
			}
			drop(guard);

			let state = self.inner.state.lock();
			if state.queue.is_empty() || state.in_flight || state.immediate_consumer().is_none() {
				return;
			}
		}
	}

	fn end_delivery(&self) {
		self.inner.state.lock().in_flight = false;
		self.inner.notify_recv.notify_waiters();
	}

	/// Receives the next message for the consumer of `generation`. Returns
	/// `None` once the mailbox is closed or that consumer was detached.
	async fn recv(&self, generation: u64) -> Option<Message> {
		loop {
			let notified = self.inner.notify_recv.notified();
			{
				let mut state = self.inner.state.lock();
				let current = state.consumer.as_ref().is_some_and(|a| a.generation == generation);
				if state.closed || !current {
					return None;
				}
				if let Some(message) = state.take_for(generation) {
					drop(state);
					self.inner.notify_send.notify_one();
					return Some(message);
				}
			}
			notified.await;
		}
	}
}

async fn run_consumer(mailbox: Mailbox, consumer: Arc<Consumer>, generation: u64, stop: CancellationToken) {
	let address = mailbox.address();
	tracing::debug!(%address, generation, context = consumer.context().as_str(), "router.consumer.start");
	loop {
		let next = tokio::select! {
			biased;
			_ = stop.cancelled() => None,
			msg = mailbox.recv(generation) => msg,
		};
		let Some(message) = next else {
			break;
		};
		consumer.deliver(message);
		mailbox.end_delivery();
		// An immediate consumer attached meanwhile waits for this delivery.
		mailbox.drain_immediate();
	}
	tracing::debug!(%address, generation, "router.consumer.stop");
}
