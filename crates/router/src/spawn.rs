//! Dependent-actor spawning with shared ownership.
//!
//! An owner declares its dependents statically through [`Actor::dependents`].
//! Registering the owner constructs and registers each dependent that is not
//! alive yet; a dependent already spawned for another owner gains an owner
//! instead. A dependent is unregistered once its last owner is released.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use courier_primitives::{Address, Addressable};
use parking_lot::Mutex;

use crate::actor::{self, Actor};
use crate::error::{SpawnError, panic_message};
use crate::mailbox::Mailbox;
use crate::registry::Registry;

type Constructor = Arc<dyn Fn() -> Result<Arc<dyn Actor>, SpawnError> + Send + Sync>;

#[derive(Clone)]
enum Target {
	Typed { address: Address, construct: Constructor },
	Named,
}

/// One statically declared dependent of an owner actor.
#[derive(Clone)]
pub struct Dependent {
	name: Cow<'static, str>,
	target: Target,
}

impl Dependent {
	/// Dependent built with `T::default()` and registered at `T`'s type address.
	pub fn of<T: Actor + Default>() -> Self {
		Self {
			name: Cow::Borrowed(std::any::type_name::<T>()),
			target: Target::Typed {
				address: Address::of::<T>(),
				construct: Arc::new(|| Ok(Arc::new(T::default()) as Arc<dyn Actor>)),
			},
		}
	}

	/// Dependent built by a fallible constructor.
	pub fn with<T, F>(construct: F) -> Self
	where
		T: Actor,
		F: Fn() -> Result<T, String> + Send + Sync + 'static,
	{
		let name = std::any::type_name::<T>();
		Self {
			name: Cow::Borrowed(name),
			target: Target::Typed {
				address: Address::of::<T>(),
				construct: Arc::new(move || match construct() {
					Ok(actor) => Ok(Arc::new(actor) as Arc<dyn Actor>),
					Err(reason) => Err(SpawnError::Construction {
						name: name.to_owned(),
						reason,
					}),
				}),
			},
		}
	}

	/// Dependent resolved by name through the router's [`SpawnCatalog`].
	pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
		Self {
			name: name.into(),
			target: Target::Named,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

impl fmt::Debug for Dependent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut s = f.debug_struct("Dependent");
		s.field("name", &self.name);
		if let Target::Typed { address, .. } = &self.target {
			s.field("address", address);
		}
		s.finish()
	}
}

/// Name to constructor table for dependents declared with [`Dependent::named`].
#[derive(Clone, Default)]
pub struct SpawnCatalog {
	entries: HashMap<Cow<'static, str>, Dependent>,
}

impl SpawnCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	/// Catalogs `T` under `name`, built with `T::default()`.
	#[must_use]
	pub fn with<T: Actor + Default>(mut self, name: impl Into<Cow<'static, str>>) -> Self {
		self.insert(name, Dependent::of::<T>());
		self
	}

	/// Catalogs a typed dependent under `name`. Named dependents are ignored.
	pub fn insert(&mut self, name: impl Into<Cow<'static, str>>, dependent: Dependent) {
		let name = name.into();
		if matches!(dependent.target, Target::Named) {
			tracing::warn!(%name, "spawn.catalog.named_entry_ignored");
			return;
		}
		self.entries.insert(name, dependent);
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.contains_key(name)
	}

	fn resolve(&self, dependent: &Dependent) -> Result<(Address, Constructor), SpawnError> {
		let target = match &dependent.target {
			Target::Named => match self.entries.get(dependent.name()) {
				Some(entry) => &entry.target,
				None => return Err(SpawnError::UnknownName(dependent.name.to_string())),
			},
			typed => typed,
		};
		match target {
			Target::Typed { address, construct } => Ok((*address, Arc::clone(construct))),
			Target::Named => Err(SpawnError::UnknownName(dependent.name.to_string())),
		}
	}
}

/// Tracks which dependents were spawned on behalf of which owners.
pub struct SpawnTracker {
	registry: Registry,
	catalog: SpawnCatalog,
	owners: Mutex<HashMap<Address, HashSet<Address>>>,
}

impl SpawnTracker {
	pub fn new(registry: Registry, catalog: SpawnCatalog) -> Self {
		Self {
			registry,
			catalog,
			owners: Mutex::new(HashMap::new()),
		}
	}

	/// Spawns the dependents of `owner`, transitively.
	///
	/// Dependents registered outside the tracker are left alone. Construction
	/// failures are logged and skipped. Constructors run without tracker locks
	/// held and may register actors themselves.
	pub fn spawn_for(&self, owner: Address, dependents: Vec<Dependent>) {
		if dependents.is_empty() {
			return;
		}
		let mut spawned: Vec<Mailbox> = Vec::new();
		let mut work: Vec<(Address, Dependent)> = dependents.into_iter().map(|d| (owner, d)).collect();
		while let Some((owner, dependent)) = work.pop() {
			let (address, construct) = match self.catalog.resolve(&dependent) {
				Ok(resolved) => resolved,
				Err(err) => {
					tracing::warn!(%owner, dependent = dependent.name(), error = %err, "spawn.resolve_failed");
					continue;
				}
			};
			if address == owner || self.join_existing(owner, address) {
				continue;
			}

			let actor = match std::panic::catch_unwind(AssertUnwindSafe(|| construct())) {
				Ok(Ok(actor)) => actor,
				Ok(Err(err)) => {
					tracing::warn!(%owner, %address, error = %err, "spawn.construct_failed");
					continue;
				}
				Err(payload) => {
					let err = SpawnError::Construction {
						name: dependent.name().to_owned(),
						reason: panic_message(payload),
					};
					tracing::warn!(%owner, %address, error = %err, "spawn.construct_failed");
					continue;
				}
			};
			let nested = match std::panic::catch_unwind(AssertUnwindSafe(|| actor.dependents())) {
				Ok(nested) => nested,
				Err(payload) => {
					tracing::warn!(%owner, %address, error = %panic_message(payload), "spawn.dependents_failed");
					Vec::new()
				}
			};
			let builder = actor::mailbox_for(actor);

			{
				let mut owners = self.owners.lock();
				// Another caller may have claimed the address while we constructed.
				if self.registry.is_registered(address) {
					match owners.get_mut(&address) {
						Some(set) => {
							set.insert(owner);
							tracing::debug!(%owner, %address, "spawn.discarded");
						}
						None => tracing::debug!(%owner, %address, "spawn.external"),
					}
					continue;
				}
				match self.registry.attach(address, builder) {
					Ok(mailbox) => spawned.push(mailbox),
					Err(err) => {
						tracing::warn!(%owner, %address, error = %err, "spawn.register_failed");
						continue;
					}
				}
				owners.entry(address).or_default().insert(owner);
			}
			tracing::debug!(%owner, %address, "spawn.spawned");
			work.extend(nested.into_iter().map(|d| (address, d)));
		}
		for mailbox in spawned {
			mailbox.drain_immediate();
		}
	}

	/// Adds `owner` to a live dependent at `address`. Returns true when the
	/// address needs no construction: either tracked and live, or registered
	/// outside the tracker. A tracked but unregistered dependent (postponed)
	/// is rebuilt and keeps its owners.
	fn join_existing(&self, owner: Address, address: Address) -> bool {
		let mut owners = self.owners.lock();
		if !self.registry.is_registered(address) {
			return false;
		}
		match owners.get_mut(&address) {
			Some(set) => {
				set.insert(owner);
				tracing::trace!(%owner, %address, owners = set.len(), "spawn.shared");
			}
			None => tracing::debug!(%owner, %address, "spawn.external"),
		}
		true
	}

	/// Drops ownership of a dependent unregistered directly, so the next
	/// owner that declares it constructs it again.
	pub(crate) fn forget(&self, address: Address) {
		if let Some(set) = self.owners.lock().remove(&address) {
			tracing::debug!(%address, owners = set.len(), "spawn.forgotten");
		}
	}

	/// Releases `owner` from every dependent, unregistering the ones left
	/// without owners along with their own dependents.
	pub fn release_for(&self, owner: impl Addressable) {
		let mut released = vec![owner.address()];
		let mut orphaned = Vec::new();
		{
			let mut owners = self.owners.lock();
			while let Some(owner) = released.pop() {
				owners.retain(|address, set| {
					if !set.remove(&owner) || !set.is_empty() {
						return true;
					}
					released.push(*address);
					orphaned.push(*address);
					false
				});
			}
		}
		for address in orphaned {
			tracing::debug!(%address, "spawn.released");
			self.registry.unregister(address);
		}
	}

	/// Owners currently keeping the dependent at `address` alive.
	pub fn owners_of(&self, address: impl Addressable) -> Vec<Address> {
		self.owners
			.lock()
			.get(&address.address())
			.map(|set| set.iter().copied().collect())
			.unwrap_or_default()
	}

	/// Addresses of every tracked dependent.
	pub fn tracked(&self) -> Vec<Address> {
		self.owners.lock().keys().copied().collect()
	}

	pub fn is_tracked(&self, address: impl Addressable) -> bool {
		self.owners.lock().contains_key(&address.address())
	}

	/// Forgets all ownership without unregistering anything.
	pub(crate) fn clear(&self) {
		self.owners.lock().clear();
	}
}
