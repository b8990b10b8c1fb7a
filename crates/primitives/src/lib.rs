//! Core value types for in-process actor routing: addresses and messages.

/// Type and instance addressing with fallback resolution.
pub mod address;
/// Immutable routed messages.
pub mod message;

pub use address::{Address, Addressable, InstanceId, TypeKey};
pub use message::{Message, MessageId};
