//! Error taxonomy for routing, delivery and spawning.

use thiserror::Error;

/// Errors surfaced synchronously to the caller of a router operation.
///
/// Failures local to one address (a throwing handler, a dependent that cannot
/// be built, an address nobody listens on) are logged instead of returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
	/// A mailbox was built without an `on_message` handler.
	#[error("mailbox for {address} has no message handler")]
	MissingHandler {
		/// Address the registration targeted.
		address: String,
	},

	/// `send` was called with an empty address list.
	#[error("no addresses specified for message {id}")]
	NoAddressesSpecified {
		/// Id of the rejected message.
		id: courier_primitives::MessageId,
	},
}

/// Failure raised by a message handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
	/// Handler returned an error.
	#[error("{0}")]
	Failed(String),

	/// Handler panicked while processing a message.
	#[error("handler panicked: {0}")]
	Panicked(String),
}

impl HandlerError {
	pub fn failed(reason: impl Into<String>) -> Self {
		Self::Failed(reason.into())
	}
}

impl From<String> for HandlerError {
	fn from(reason: String) -> Self {
		Self::Failed(reason)
	}
}

impl From<&str> for HandlerError {
	fn from(reason: &str) -> Self {
		Self::Failed(reason.to_owned())
	}
}

/// Lets handlers forward with `?` when a send from inside them is rejected.
impl From<RouterError> for HandlerError {
	fn from(err: RouterError) -> Self {
		Self::Failed(err.to_string())
	}
}

/// A dependent actor could not be constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
	/// The constructor reported a failure.
	#[error("failed to construct {name}: {reason}")]
	Construction {
		/// Declared dependent name.
		name: String,
		/// Constructor failure message.
		reason: String,
	},

	/// A dependent was declared by name but nothing is cataloged under it.
	#[error("no constructor cataloged for {0}")]
	UnknownName(String),
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_owned()
	} else if let Ok(s) = payload.downcast::<String>() {
		*s
	} else {
		"non-string panic payload".to_owned()
	}
}

/// Result of one handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
