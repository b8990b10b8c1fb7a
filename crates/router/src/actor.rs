use std::sync::Arc;

use courier_primitives::{Address, Message};

use crate::error::HandlerResult;
use crate::mailbox::MailboxBuilder;
use crate::spawn::Dependent;
use crate::work::WorkContext;

/// Self-describing mailbox consumer.
///
/// An actor names its own address, the context its handler runs on, and the
/// dependents that must be alive while it is registered.
pub trait Actor: Send + Sync + 'static {
	/// Handles one message. Errors and panics are reported to the mailbox
	/// error handler and never reach the sender.
	fn on_message(&self, message: &Message) -> HandlerResult;

	fn work_context(&self) -> WorkContext {
		WorkContext::Immediate
	}

	/// Address to register at. Defaults to the type address.
	fn address(&self) -> Address {
		Address::of::<Self>()
	}

	/// Actors spawned on behalf of this one and released with it.
	fn dependents(&self) -> Vec<Dependent> {
		Vec::new()
	}

	/// Called once when the actor's mailbox is completed.
	fn on_unregister(&self) {}
}

/// Builds the mailbox consumer that forwards to `actor`.
pub(crate) fn mailbox_for(actor: Arc<dyn Actor>) -> MailboxBuilder {
	let handler = Arc::clone(&actor);
	MailboxBuilder::new()
		.work_context(actor.work_context())
		.on_message(move |message| handler.on_message(message))
		.on_closed(move || actor.on_unregister())
}
