use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::Address;

/// Numeric message discriminator chosen by the application.
pub type MessageId = i32;

/// Immutable routed message.
///
/// Cloning is cheap: the payload is shared, never copied.
#[derive(Clone)]
pub struct Message {
	id: MessageId,
	content: Option<Arc<dyn Any + Send + Sync>>,
	reply_to: Option<Address>,
}

impl Message {
	/// Creates a content-less message.
	pub const fn new(id: MessageId) -> Self {
		Self {
			id,
			content: None,
			reply_to: None,
		}
	}

	/// Creates a message carrying `content`.
	pub fn with_content<T: Any + Send + Sync>(id: MessageId, content: T) -> Self {
		Self {
			id,
			content: Some(Arc::new(content)),
			reply_to: None,
		}
	}

	/// Creates a message from already shared content.
	pub fn with_shared_content(id: MessageId, content: Arc<dyn Any + Send + Sync>) -> Self {
		Self {
			id,
			content: Some(content),
			reply_to: None,
		}
	}

	/// Returns a copy of this message that names `address` as the reply target.
	#[must_use]
	pub fn reply_to(mut self, address: Address) -> Self {
		self.reply_to = Some(address);
		self
	}

	pub const fn id(&self) -> MessageId {
		self.id
	}

	/// Downcasts the payload. Returns `None` if absent or of another type.
	pub fn content<T: Any>(&self) -> Option<&T> {
		self.content.as_deref().and_then(|c| c.downcast_ref::<T>())
	}

	pub fn has_content(&self) -> bool {
		self.content.is_some()
	}

	/// Address the receiver should answer to, if any.
	pub const fn reply_address(&self) -> Option<Address> {
		self.reply_to
	}
}

impl fmt::Debug for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Message")
			.field("id", &self.id)
			.field("content", &self.content.as_ref().map(|_| ".."))
			.field("reply_to", &self.reply_to)
			.finish()
	}
}

impl From<MessageId> for Message {
	fn from(id: MessageId) -> Self {
		Self::new(id)
	}
}
