//! Initialization gate.
//!
//! Every public fetcher operation awaits [`ReadyGate::ready`] first. Callers arriving before
//! [`Fetcher::initialize`](crate::Fetcher::initialize) are parked in a FIFO queue and released in
//! enqueue order once the startup routines succeed.

use std::future::pending;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::Result;

/// Fetcher lifecycle state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Status {
	/// Constructed, `initialize` not yet called.
	NotInitialized,
	/// Context bound, startup work in progress.
	Initializing,
	/// Startup complete, accepting requests.
	Ready,
	/// Context extraction or startup failed.
	Error,
}

/// Inputs driving [`Status`] transitions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Transition {
	/// `initialize` was called.
	Initialize,
	/// Startup routines resolved.
	StartupSucceeded,
	/// Context extraction or a startup routine failed.
	StartupFailed,
}

impl Status {
	/// Next state for `transition`, or `None` when the pair is not a legal transition.
	///
	/// `Initializing × Initialize` stays in `Initializing`; the caller joins the in-flight run.
	pub fn on(self, transition: Transition) -> Option<Status> {
		use Status::*;
		use Transition::*;

		match (self, transition) {
			(NotInitialized | Ready | Error | Initializing, Initialize) => Some(Initializing),
			(Initializing, StartupSucceeded) => Some(Ready),
			(Initializing, StartupFailed) => Some(Error),
			_ => None,
		}
	}
}

/// How a call to `initialize` was admitted.
#[derive(Debug)]
pub(crate) enum Admission {
	/// This caller drives the initialization.
	Leader,
	/// An initialization is already running; resolves when it succeeds.
	Follower(oneshot::Receiver<()>),
}

struct GateState {
	status: Status,
	pending: Vec<oneshot::Sender<()>>,
}

impl GateState {
	fn apply(&mut self, transition: Transition) {
		match self.status.on(transition) {
			Some(next) => {
				debug!(from = ?self.status, to = ?next, ?transition, "fetcher.status");
				self.status = next;
			}
			None => warn!(status = ?self.status, ?transition, "Ignoring illegal status transition"),
		}
	}

	fn enqueue(&mut self) -> oneshot::Receiver<()> {
		let (tx, rx) = oneshot::channel();
		self.pending.push(tx);
		rx
	}
}

/// Initialization state machine with its queue of parked callers.
pub struct ReadyGate {
	state: Mutex<GateState>,
}

impl Default for ReadyGate {
	fn default() -> Self {
		Self::new()
	}
}

impl ReadyGate {
	/// Create a gate in [`Status::NotInitialized`].
	pub fn new() -> Self {
		Self {
			state: Mutex::new(GateState {
				status: Status::NotInitialized,
				pending: Vec::new(),
			}),
		}
	}

	/// Current status.
	pub fn status(&self) -> Status {
		self.state.lock().status
	}

	/// Number of parked callers.
	pub fn queued(&self) -> usize {
		self.state.lock().pending.len()
	}

	/// Wait until operations may proceed.
	///
	/// Completes immediately while `Ready` or `Initializing`. While `NotInitialized` the caller is
	/// queued. While `Error` the caller is parked as well: it stays pending unless a later
	/// `initialize` succeeds. There is no timeout.
	pub async fn ready(&self) {
		let rx = {
			let mut state = self.state.lock();
			match state.status {
				Status::Ready | Status::Initializing => return,
				Status::NotInitialized | Status::Error => state.enqueue(),
			}
		};

		if rx.await.is_err() {
			// Gate dropped with the caller still parked.
			pending::<()>().await;
		}
	}

	/// Admit a call to `initialize`.
	///
	/// If an initialization is already running the caller becomes a follower queued behind it.
	/// Otherwise the gate moves to `Initializing` and `prepare` runs under the gate lock before any
	/// other caller can observe the new status; a failing `prepare` moves the gate to `Error`.
	pub(crate) fn begin(&self, prepare: impl FnOnce() -> Result<()>) -> Result<Admission> {
		let mut state = self.state.lock();
		if state.status == Status::Initializing {
			return Ok(Admission::Follower(state.enqueue()));
		}

		state.apply(Transition::Initialize);
		if let Err(e) = prepare() {
			state.apply(Transition::StartupFailed);
			return Err(e);
		}
		Ok(Admission::Leader)
	}

	/// Record the outcome of the leader's initialization.
	///
	/// On success the gate becomes `Ready` and every parked caller is released in FIFO order. On
	/// failure the gate becomes `Error` and parked callers stay parked.
	pub(crate) fn finish(&self, ok: bool) {
		let mut state = self.state.lock();
		if !ok {
			state.apply(Transition::StartupFailed);
			if !state.pending.is_empty() {
				warn!(parked = state.pending.len(), "Initialization failed with callers still parked");
			}
			return;
		}

		state.apply(Transition::StartupSucceeded);
		let pending = std::mem::take(&mut state.pending);
		debug!(released = pending.len(), "fetcher.ready");
		for tx in pending {
			let _ = tx.send(());
		}
	}
}
