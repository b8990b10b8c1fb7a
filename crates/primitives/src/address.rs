use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of an addressable type.
///
/// Equality and hashing use only the [`TypeId`]; the name is carried for logs.
#[derive(Clone, Copy)]
pub struct TypeKey {
	id: TypeId,
	name: &'static str,
}

impl TypeKey {
	/// Returns the key for `T`.
	pub fn of<T: ?Sized + 'static>() -> Self {
		Self {
			id: TypeId::of::<T>(),
			name: std::any::type_name::<T>(),
		}
	}

	/// Fully qualified type name.
	pub const fn name(&self) -> &'static str {
		self.name
	}

	/// Last path segment of the type name, without generics.
	pub fn short_name(&self) -> &'static str {
		let base = self.name.split('<').next().unwrap_or(self.name);
		base.rsplit("::").next().unwrap_or(base)
	}
}

impl PartialEq for TypeKey {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.id.hash(state);
	}
}

impl fmt::Debug for TypeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "TypeKey({})", self.name)
	}
}

impl fmt::Display for TypeKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.short_name())
	}
}

/// Process-unique identity of one actor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
	/// Allocates a fresh identity. Never returns the same value twice.
	pub fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}

	/// Raw identity value.
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for InstanceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Logical message destination.
///
/// A type address names the singleton mailbox of a type. An instance address
/// names one object and falls back to its type address when no mailbox is
/// registered for the instance itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
	ByType(TypeKey),
	ByInstance(InstanceId, TypeKey),
}

impl Address {
	/// Type address of `T`.
	pub fn of<T: ?Sized + 'static>() -> Self {
		Self::ByType(TypeKey::of::<T>())
	}

	/// Instance address for `id` of type `ty`.
	pub const fn instance(id: InstanceId, ty: TypeKey) -> Self {
		Self::ByInstance(id, ty)
	}

	/// Instance address for a fresh instance of `T`.
	pub fn new_instance<T: ?Sized + 'static>() -> Self {
		Self::ByInstance(InstanceId::next(), TypeKey::of::<T>())
	}

	/// Type identity behind this address.
	pub const fn type_key(&self) -> TypeKey {
		match self {
			Self::ByType(ty) | Self::ByInstance(_, ty) => *ty,
		}
	}

	/// Instance identity, if this is an instance address.
	pub const fn instance_id(&self) -> Option<InstanceId> {
		match self {
			Self::ByType(_) => None,
			Self::ByInstance(id, _) => Some(*id),
		}
	}

	/// The type address this address falls back to.
	pub const fn type_address(&self) -> Address {
		Self::ByType(self.type_key())
	}

	pub const fn is_type(&self) -> bool {
		matches!(self, Self::ByType(_))
	}

	/// Lookup keys in resolution order: the exact key, then the type fallback.
	pub fn candidates(&self) -> impl Iterator<Item = Address> + use<> {
		let fallback = match self {
			Self::ByType(_) => None,
			Self::ByInstance(_, ty) => Some(Self::ByType(*ty)),
		};
		std::iter::once(*self).chain(fallback)
	}

	/// Returns true when `other` resolves against `self`, i.e. they are equal
	/// or `self` is the type address of instance address `other`.
	pub fn subsumes(&self, other: &Address) -> bool {
		match (self, other) {
			(Self::ByType(ty), Self::ByInstance(_, other_ty)) => ty == other_ty,
			_ => self == other,
		}
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::ByType(ty) => write!(f, "{ty}"),
			Self::ByInstance(id, ty) => write!(f, "{ty}{id}"),
		}
	}
}

impl From<TypeKey> for Address {
	fn from(ty: TypeKey) -> Self {
		Self::ByType(ty)
	}
}

/// Anything that normalizes into a canonical [`Address`].
pub trait Addressable {
	fn address(&self) -> Address;
}

impl Addressable for Address {
	fn address(&self) -> Address {
		*self
	}
}

impl Addressable for TypeKey {
	fn address(&self) -> Address {
		Address::ByType(*self)
	}
}

impl<T: Addressable + ?Sized> Addressable for &T {
	fn address(&self) -> Address {
		(**self).address()
	}
}
