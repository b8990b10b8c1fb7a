//! In-process actor routing.
//!
//! Components register a consumer at an [`Address`] and receive messages
//! through a bounded, ordered [`Mailbox`]. A [`Router`] composes:
//!
//! * [`Registry`]: at most one mailbox per address, with type-address fallback
//!   for instance addresses and postponement that keeps buffering while no
//!   consumer is attached.
//! * [`ActorScheduler`]: delayed sends, deduplicated per address and message
//!   id, with idempotent cancellation.
//! * [`SpawnTracker`]: dependents spawned for owner actors and released with
//!   their last owner.
//!
//! ```no_run
//! use courier_router::{Address, Router, WorkContext};
//!
//! struct Counter;
//!
//! # async fn demo() -> courier_router::Result<()> {
//! let router = Router::default();
//! router.register(Address::of::<Counter>(), WorkContext::Immediate, |msg| {
//! 	tracing::info!(id = msg.id(), "counted");
//! 	Ok(())
//! })?;
//! router.send_id(1, &[Address::of::<Counter>()]).await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod spawn;
pub mod testing;
pub mod work;

pub use actor::Actor;
pub use config::{ConfigError, RouterConfig};
pub use courier_primitives::{Address, Addressable, InstanceId, Message, MessageId, TypeKey};
pub use error::{HandlerError, HandlerResult, Result, RouterError, SpawnError};
pub use mailbox::{Mailbox, MailboxBuilder, PushError, PushOutcome};
pub use registry::Registry;
pub use router::{MessageBuilder, Router};
pub use scheduler::{ActorScheduler, Cancellable, ScheduledSend};
pub use spawn::{Dependent, SpawnCatalog, SpawnTracker};
pub use work::{TaskClass, WorkContext};
