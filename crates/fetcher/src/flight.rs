//! Single-flight resolution map.
//!
//! Each key is either being resolved by exactly one leader (with any number of followers waiting
//! on a `watch` channel) or holds a memoized value. Concurrent identical requests therefore share
//! one underlying resolution.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::{Error, Result};

type Outcome<V> = Option<Result<V>>;

enum Slot<V> {
	InFlight { generation: u64, rx: watch::Receiver<Outcome<V>> },
	Resolved(V),
}

struct FlightState<K, V> {
	slots: HashMap<K, Slot<V>>,
	next_generation: u64,
}

enum Role<V> {
	Leader { generation: u64, tx: watch::Sender<Outcome<V>> },
	Follower(watch::Receiver<Outcome<V>>),
}

/// Map from key to an in-flight resolution or a memoized value.
pub(crate) struct SingleFlight<K, V> {
	state: Mutex<FlightState<K, V>>,
}

impl<K, V> Default for SingleFlight<K, V> {
	fn default() -> Self {
		Self {
			state: Mutex::new(FlightState {
				slots: HashMap::new(),
				next_generation: 0,
			}),
		}
	}
}

impl<K, V> SingleFlight<K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	/// Return the memoized value for `key`, joining or starting its resolution as needed.
	///
	/// The first caller for an unresolved key runs `resolve`; callers arriving while it runs wait
	/// for the same outcome. Success is memoized until [`Self::invalidate`]; failure is handed to
	/// every waiter and leaves the key unresolved.
	pub(crate) async fn get_or_resolve<F, Fut>(&self, key: &K, resolve: F) -> Result<V>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<V>>,
	{
		let role = {
			let mut state = self.state.lock();
			match state.slots.get(key) {
				Some(Slot::Resolved(value)) => {
					trace!("flight.hit");
					return Ok(value.clone());
				}
				Some(Slot::InFlight { rx, .. }) => Role::Follower(rx.clone()),
				None => {
					state.next_generation += 1;
					let generation = state.next_generation;
					let (tx, rx) = watch::channel(None);
					state.slots.insert(key.clone(), Slot::InFlight { generation, rx });
					Role::Leader { generation, tx }
				}
			}
		};

		match role {
			Role::Follower(rx) => wait_for(rx).await,
			Role::Leader { generation, tx } => {
				let guard = FlightGuard {
					flight: self,
					key: key.clone(),
					generation,
					tx,
					completed: false,
				};
				let outcome = resolve().await;
				guard.complete(outcome)
			}
		}
	}

	/// Memoized value for `key`, if resolved.
	pub(crate) fn peek(&self, key: &K) -> Option<V> {
		match self.state.lock().slots.get(key) {
			Some(Slot::Resolved(value)) => Some(value.clone()),
			_ => None,
		}
	}

	/// Forget `key`. An in-flight leader for it still answers its waiters but memoizes nothing.
	pub(crate) fn invalidate(&self, key: &K) -> bool {
		self.state.lock().slots.remove(key).is_some()
	}

	/// Forget every key matching `predicate`.
	pub(crate) fn invalidate_where(&self, mut predicate: impl FnMut(&K) -> bool) {
		self.state.lock().slots.retain(|key, _| !predicate(key));
	}

	/// Number of memoized values.
	pub(crate) fn resolved_len(&self) -> usize {
		self.state
			.lock()
			.slots
			.values()
			.filter(|slot| matches!(slot, Slot::Resolved(_)))
			.count()
	}
}

async fn wait_for<V: Clone>(mut rx: watch::Receiver<Outcome<V>>) -> Result<V> {
	loop {
		let current = rx.borrow_and_update().clone();
		if let Some(outcome) = current {
			return outcome;
		}
		if rx.changed().await.is_err() {
			return Err(Error::Abandoned);
		}
	}
}

/// Publishes the leader's outcome; un-wedges followers if the leader is dropped mid-flight.
struct FlightGuard<'a, K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	flight: &'a SingleFlight<K, V>,
	key: K,
	generation: u64,
	tx: watch::Sender<Outcome<V>>,
	completed: bool,
}

impl<K, V> FlightGuard<'_, K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	fn complete(mut self, outcome: Result<V>) -> Result<V> {
		self.completed = true;
		{
			let mut state = self.flight.state.lock();
			let owned = matches!(
				state.slots.get(&self.key),
				Some(Slot::InFlight { generation, .. }) if *generation == self.generation
			);
			if owned {
				match &outcome {
					Ok(value) => {
						state.slots.insert(self.key.clone(), Slot::Resolved(value.clone()));
					}
					Err(_) => {
						state.slots.remove(&self.key);
					}
				}
			}
		}
		self.tx.send_replace(Some(outcome.clone()));
		outcome
	}
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	fn drop(&mut self) {
		if self.completed {
			return;
		}

		let mut state = self.flight.state.lock();
		if matches!(
			state.slots.get(&self.key),
			Some(Slot::InFlight { generation, .. }) if *generation == self.generation
		) {
			state.slots.remove(&self.key);
		}
		drop(state);
		self.tx.send_replace(Some(Err(Error::Abandoned)));
	}
}
