//! In-memory transport used by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use url::Url;

use crate::sites::SiteHandle;
use crate::transport::{RawRequest, RestRequest, RestTransport, SiteInfo};
use crate::{Error, Result};

/// Routes requests by path to canned responses and records everything it sees.
#[derive(Default)]
pub(crate) struct MockTransport {
	pub open_count: AtomicUsize,
	pub opened: Mutex<Vec<Url>>,
	/// When set, `open_site` waits for a permit before returning.
	pub open_gate: Option<Arc<Notify>>,
	pub fail_open: Mutex<Option<Error>>,

	/// Responses for single and batched REST operations, keyed by path.
	pub rest: Mutex<HashMap<String, Result<Value>>>,
	/// When set, `send` waits for a permit before answering.
	pub send_gate: Mutex<Option<Arc<Notify>>>,
	pub sent: Mutex<Vec<RestRequest>>,
	pub send_count: AtomicUsize,
	pub batches: Mutex<Vec<Vec<RestRequest>>>,
	pub fail_batch: Mutex<Option<Error>>,

	/// Responses for raw posts, popped per path in FIFO order.
	pub raw: Mutex<HashMap<String, Vec<Result<String>>>>,
	pub raw_posts: Mutex<Vec<RawRequest>>,
}

impl MockTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
		Arc::new(Self {
			open_gate: Some(gate),
			..Default::default()
		})
	}

	pub fn respond(&self, path: &str, response: Result<Value>) {
		self.rest.lock().insert(path.to_string(), response);
	}

	pub fn respond_raw(&self, path: &str, response: Result<String>) {
		self.raw.lock().entry(path.to_string()).or_default().push(response);
	}

	pub fn batch_count(&self) -> usize {
		self.batches.lock().len()
	}

	pub fn batch_sizes(&self) -> Vec<usize> {
		self.batches.lock().iter().map(Vec::len).collect()
	}

	pub fn raw_posts_to(&self, path: &str) -> Vec<RawRequest> {
		self.raw_posts.lock().iter().filter(|r| r.path == path).cloned().collect()
	}

	fn lookup(&self, request: &RestRequest) -> Result<Value> {
		self.rest
			.lock()
			.get(&request.path)
			.cloned()
			.unwrap_or_else(|| Err(Error::remote(404, format!("no route for {}", request.path))))
	}
}

#[async_trait]
impl RestTransport for MockTransport {
	async fn open_site(&self, url: &Url) -> Result<SiteInfo> {
		self.open_count.fetch_add(1, Ordering::SeqCst);
		self.opened.lock().push(url.clone());
		if let Some(gate) = &self.open_gate {
			gate.notified().await;
		}
		if let Some(err) = self.fail_open.lock().clone() {
			return Err(err);
		}
		Ok(SiteInfo {
			web_id: Some(format!("web:{}", url.path())),
			title: None,
		})
	}

	async fn send(&self, _site: &SiteHandle, request: RestRequest) -> Result<Value> {
		self.send_count.fetch_add(1, Ordering::SeqCst);
		let gate = self.send_gate.lock().clone();
		if let Some(gate) = gate {
			gate.notified().await;
		}
		let response = self.lookup(&request);
		self.sent.lock().push(request);
		response
	}

	async fn send_batch(&self, _site: &SiteHandle, requests: Vec<RestRequest>) -> Result<Vec<Result<Value>>> {
		self.batches.lock().push(requests.clone());
		if let Some(err) = self.fail_batch.lock().clone() {
			return Err(err);
		}
		Ok(requests.iter().map(|r| self.lookup(r)).collect())
	}

	async fn post_raw(&self, _site: &SiteHandle, request: RawRequest) -> Result<String> {
		let response = {
			let mut raw = self.raw.lock();
			match raw.get_mut(&request.path) {
				Some(queue) if !queue.is_empty() => queue.remove(0),
				_ => Err(Error::remote(404, format!("no raw route for {}", request.path))),
			}
		};
		self.raw_posts.lock().push(request);
		response
	}
}
