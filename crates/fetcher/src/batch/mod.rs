//! Time-windowed batch multiplexer.
//!
//! Operations issued against the same `(window, site)` key within one window share a [`Batch`]
//! and travel in a single round trip. A window closes when its timer fires or when it has admitted
//! [`MAX_BATCH_OPERATIONS`] checkouts or operations, whichever comes first; later work opens a new
//! window.
//!
//! # Window lifecycle
//!
//! 1. The first checkout for a key opens a slot and spawns its timer.
//! 2. Each checkout increments the slot's pending count and returns the shared batch.
//! 3. A checkout that would exceed the cap, or an add to a batch already holding the cap, retires
//!    the slot; the retired batch still runs on its own timer. An overflowing add lands in the
//!    next window.
//! 4. When the timer fires the slot is removed (if it is still the active one for the key) and,
//!    after a short grace period, the batch executes exactly once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::sites::{SiteHandle, SiteKey};
use crate::transport::{RestRequest, RestTransport};
use crate::{Error, Result};

/// Hard cap on checkouts and operations admitted into a single window.
pub const MAX_BATCH_OPERATIONS: usize = 50;

/// Identifies one coalescing window: its length and the site it targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
	/// Window length.
	pub window: Duration,
	/// Target site.
	pub site: SiteKey,
}

impl BatchKey {
	/// Create a key.
	pub fn new(window: Duration, site: SiteKey) -> Self {
		Self { window, site }
	}
}

struct Queued {
	request: RestRequest,
	respond: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct BatchQueue {
	entries: Vec<Queued>,
	executed: bool,
}

struct BatchInner {
	site: SiteHandle,
	transport: Arc<dyn RestTransport>,
	queue: Mutex<BatchQueue>,
	lane: Option<Lane>,
}

/// Shared batch handle; operations added to it are sent together.
#[derive(Clone)]
pub struct Batch {
	inner: Arc<BatchInner>,
}

impl fmt::Debug for Batch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let queue = self.inner.queue.lock();
		f.debug_struct("Batch")
			.field("site", &self.inner.site.id())
			.field("queued", &queue.entries.len())
			.field("executed", &queue.executed)
			.finish()
	}
}

impl Batch {
	/// Create an empty batch bound to `site`, outside any window and without a cap.
	pub fn new(site: SiteHandle, transport: Arc<dyn RestTransport>) -> Self {
		Self::with_lane(site, transport, None)
	}

	fn with_lane(site: SiteHandle, transport: Arc<dyn RestTransport>, lane: Option<Lane>) -> Self {
		Self {
			inner: Arc::new(BatchInner {
				site,
				transport,
				queue: Mutex::new(BatchQueue::default()),
				lane,
			}),
		}
	}

	/// Site the batch targets.
	pub fn site(&self) -> &SiteHandle {
		&self.inner.site
	}

	/// Queue an operation. The returned future resolves once the batch has executed.
	///
	/// A batch handed out by a [`BatchMultiplexer`] holds at most its cap of operations; adding to
	/// a full one retires its window and queues the operation in the next window for the same
	/// key. Adding to a batch that has already executed resolves to [`Error::BatchClosed`].
	pub fn add(&self, request: RestRequest) -> BatchResponse {
		let (tx, rx) = oneshot::channel();
		let queued = Queued { request, respond: tx };
		match &self.inner.lane {
			Some(lane) => lane.enqueue(self, queued),
			None => {
				let _ = self.try_push(queued, usize::MAX);
			}
		}
		BatchResponse { rx }
	}

	/// Queue `queued` unless the batch already holds `cap` operations, in which case it is handed
	/// back.
	fn try_push(&self, queued: Queued, cap: usize) -> Option<Queued> {
		let mut queue = self.inner.queue.lock();
		if queue.executed {
			let _ = queued.respond.send(Err(Error::BatchClosed));
			return None;
		}
		if queue.entries.len() >= cap {
			return Some(queued);
		}
		queue.entries.push(queued);
		None
	}

	/// Number of queued operations.
	pub fn len(&self) -> usize {
		self.inner.queue.lock().entries.len()
	}

	/// Returns true when nothing is queued.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns true once the batch has been sent.
	pub fn is_executed(&self) -> bool {
		self.inner.queue.lock().executed
	}

	/// Returns true if both values are the same batch.
	pub fn same_batch(&self, other: &Batch) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}

	/// Send every queued operation in one round trip and resolve their responses.
	///
	/// Runs at most once; later calls are no-ops returning `Ok(0)`. An empty batch issues no call.
	pub(crate) async fn execute(&self) -> Result<usize> {
		let entries = {
			let mut queue = self.inner.queue.lock();
			if queue.executed {
				return Ok(0);
			}
			queue.executed = true;
			std::mem::take(&mut queue.entries)
		};
		if entries.is_empty() {
			trace!(site = %self.inner.site.id(), "batch.empty");
			return Ok(0);
		}

		let count = entries.len();
		let (requests, responders): (Vec<_>, Vec<_>) = entries.into_iter().map(|q| (q.request, q.respond)).unzip();
		debug!(site = %self.inner.site.id(), operations = count, "batch.execute");

		match self.inner.transport.send_batch(&self.inner.site, requests).await {
			Ok(results) => {
				if results.len() != count {
					warn!(expected = count, got = results.len(), "Batch response count mismatch");
				}
				let mut results = results.into_iter();
				for respond in responders {
					let result = results
						.next()
						.unwrap_or_else(|| Err(Error::Protocol("batch response missing for operation".into())));
					let _ = respond.send(result);
				}
				Ok(count)
			}
			Err(e) => {
				for respond in responders {
					let _ = respond.send(Err(e.clone()));
				}
				Err(e)
			}
		}
	}
}

/// Pending result of one batched operation.
#[must_use = "a batched operation's result is only observable by awaiting its response"]
#[derive(Debug)]
pub struct BatchResponse {
	rx: oneshot::Receiver<Result<Value>>,
}

impl BatchResponse {
	/// Await the response and decode it.
	pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
		let value = self.await?;
		Ok(serde_json::from_value(value)?)
	}
}

impl Future for BatchResponse {
	type Output = Result<Value>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(Error::Abandoned)))
	}
}

/// Link from a multiplexed batch back to the window table of its key.
struct Lane {
	windows: Weak<Windows>,
	key: BatchKey,
}

impl Lane {
	fn enqueue(&self, batch: &Batch, queued: Queued) {
		let Some(windows) = self.windows.upgrade() else {
			let _ = batch.try_push(queued, usize::MAX);
			return;
		};
		let mut target = batch.clone();
		let mut queued = queued;
		while let Some(overflow) = target.try_push(queued, windows.cap) {
			queued = overflow;
			target = windows.rollover(&self.key, &target);
		}
	}
}

struct BatchSlot {
	batch: Batch,
	pending: usize,
	generation: u64,
}

#[derive(Default)]
struct SlotTable {
	slots: HashMap<BatchKey, BatchSlot>,
	next_generation: u64,
}

struct Windows {
	table: Mutex<SlotTable>,
	cap: usize,
	grace: Duration,
}

fn window_ms(key: &BatchKey) -> u64 {
	u64::try_from(key.window.as_millis()).unwrap_or(u64::MAX)
}

impl Windows {
	/// Open a window for `key` whose batch targets `site`, with `pending` checkouts admitted.
	fn open(
		self: &Arc<Self>,
		table: &mut SlotTable,
		key: &BatchKey,
		site: SiteHandle,
		transport: Arc<dyn RestTransport>,
		pending: usize,
	) -> Batch {
		table.next_generation += 1;
		let generation = table.next_generation;
		let lane = Lane {
			windows: Arc::downgrade(self),
			key: key.clone(),
		};
		let batch = Batch::with_lane(site, transport, Some(lane));
		table.slots.insert(
			key.clone(),
			BatchSlot {
				batch: batch.clone(),
				pending,
				generation,
			},
		);
		debug!(site = %key.site, window_ms = window_ms(key), generation, "batch.open");
		self.schedule(key.clone(), generation, batch.clone());
		batch
	}

	/// Retire `full` if it is still the active batch for `key` and return a batch with room.
	fn rollover(self: &Arc<Self>, key: &BatchKey, full: &Batch) -> Batch {
		let mut table = self.table.lock();
		if let Some(slot) = table.slots.get(key) {
			if slot.batch.same_batch(full) {
				debug!(site = %key.site, window_ms = window_ms(key), cap = self.cap, "batch.retire");
				table.slots.remove(key);
			} else if slot.batch.len() < self.cap {
				return slot.batch.clone();
			}
		}
		self.open(&mut table, key, full.inner.site.clone(), full.inner.transport.clone(), 0)
	}

	fn schedule(self: &Arc<Self>, key: BatchKey, generation: u64, batch: Batch) {
		let windows = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(key.window).await;
			{
				let mut table = windows.table.lock();
				let active = table.slots.get(&key).is_some_and(|slot| slot.generation == generation);
				if active {
					table.slots.remove(&key);
				}
			}
			if !windows.grace.is_zero() {
				tokio::time::sleep(windows.grace).await;
			}
			if let Err(e) = batch.execute().await {
				debug!(site = %key.site, generation, error = %e, "batch.failed");
			}
		});
	}
}

/// Hands out shared batches per [`BatchKey`] and commits them when their window closes.
pub struct BatchMultiplexer {
	windows: Arc<Windows>,
}

impl BatchMultiplexer {
	/// Create a multiplexer admitting `cap` checkouts and operations per window (clamped to
	/// [`MAX_BATCH_OPERATIONS`]) and waiting `grace` between window close and execution.
	pub fn new(cap: usize, grace: Duration) -> Self {
		Self {
			windows: Arc::new(Windows {
				table: Mutex::new(SlotTable::default()),
				cap: cap.clamp(1, MAX_BATCH_OPERATIONS),
				grace,
			}),
		}
	}

	/// Effective per-window cap.
	pub fn cap(&self) -> usize {
		self.windows.cap
	}

	/// Number of open windows.
	pub fn open_windows(&self) -> usize {
		self.windows.table.lock().slots.len()
	}

	/// Return the open batch for `key`, opening a new window against `site` if none is available.
	///
	/// Must be called within a tokio runtime; the window timer is a spawned task.
	pub fn checkout(&self, key: &BatchKey, site: SiteHandle, transport: Arc<dyn RestTransport>) -> Batch {
		let cap = self.windows.cap;
		let mut table = self.windows.table.lock();
		if let Some(slot) = table.slots.get_mut(key) {
			if slot.pending < cap && slot.batch.len() < cap {
				slot.pending += 1;
				return slot.batch.clone();
			}
			debug!(site = %key.site, window_ms = window_ms(key), cap, "batch.retire");
			table.slots.remove(key);
		}
		self.windows.open(&mut table, key, site, transport, 1)
	}
}
