use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;

#[cfg(test)]
use mockall::automock;

use crate::{
	consts::{DEFAULT_PAGE_MAX_SIZE, DEFAULT_SERVER_WAIT},
	page::Page,
	session::Session,
};

pub(crate) use server::EvictServer;
pub use server::{DiscardWriter, EvictWriter};

mod server;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictConfig {
	/// Pages with a larger footprint get a forced eviction scheduled.
	pub page_max_size: usize,

	/// How long the eviction server sleeps between passes when nobody wakes it.
	pub server_wait: Duration,
}

impl Default for EvictConfig {
	fn default() -> Self {
		Self {
			page_max_size: DEFAULT_PAGE_MAX_SIZE,
			server_wait: DEFAULT_SERVER_WAIT,
		}
	}
}

/// A page the eviction server should evict.
///
/// If `waiter` is set, the server completes that session's operation once the
/// page is gone.
#[derive(Debug)]
pub struct EvictRequest {
	pub page: Arc<Page>,
	pub waiter: Option<Arc<Session>>,
}

impl EvictRequest {
	pub fn forced(page: Arc<Page>) -> Self {
		Self { page, waiter: None }
	}

	pub fn for_session(page: Arc<Page>, session: Arc<Session>) -> Self {
		Self {
			page,
			waiter: Some(session),
		}
	}
}

/// The eviction side as seen by serialized operations.
#[cfg_attr(test, automock)]
pub trait EvictApi: Send + Sync {
	fn is_page_oversized(&self, page: &Page) -> bool;
	fn schedule(&self, request: EvictRequest);
	fn wake_server(&self);
}

#[derive(Debug, Default)]
pub struct EvictStats {
	wakeups: AtomicU64,
	scheduled: AtomicU64,
	forced: AtomicU64,
	evicted: AtomicU64,
	failed: AtomicU64,
}

impl EvictStats {
	/// Passes the eviction server made because it was woken or had work queued.
	pub fn wakeups(&self) -> u64 {
		self.wakeups.load(Ordering::Relaxed)
	}

	pub fn scheduled(&self) -> u64 {
		self.scheduled.load(Ordering::Relaxed)
	}

	/// Requests scheduled because a page grew too large.
	pub fn forced(&self) -> u64 {
		self.forced.load(Ordering::Relaxed)
	}

	pub fn evicted(&self) -> u64 {
		self.evicted.load(Ordering::Relaxed)
	}

	pub fn failed(&self) -> u64 {
		self.failed.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Default)]
struct QueueState {
	requests: VecDeque<EvictRequest>,
	woken: bool,
}

/// Requests waiting for the eviction server, and the server's wakeup signal.
#[derive(Debug)]
pub(crate) struct EvictQueue {
	state: Mutex<QueueState>,
	wake: Condvar,
	shutdown: AtomicBool,
	page_max_size: usize,
	stats: EvictStats,
}
assert_impl_all!(EvictQueue: Send, Sync);

impl EvictQueue {
	pub fn new(config: &EvictConfig) -> Self {
		Self {
			state: Mutex::new(QueueState::default()),
			wake: Condvar::new(),
			shutdown: AtomicBool::new(false),
			page_max_size: config.page_max_size,
			stats: EvictStats::default(),
		}
	}

	#[inline]
	pub fn stats(&self) -> &EvictStats {
		&self.stats
	}

	pub fn len(&self) -> usize {
		self.state.lock().requests.len()
	}

	fn push(&self, request: EvictRequest) {
		if self.shutdown.load(Ordering::Acquire) {
			warn!(
				"Eviction of {} was requested after the eviction server stopped",
				request.page.id()
			);
		}
		self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
		if request.waiter.is_none() {
			self.stats.forced.fetch_add(1, Ordering::Relaxed);
		}
		self.state.lock().requests.push_back(request);
	}

	fn wake(&self) {
		let mut state = self.state.lock();
		state.woken = true;
		self.wake.notify_one();
	}

	/// Blocks until there is work or the server was woken, and takes all queued
	/// requests. Returns `None` once shutdown was requested and the queue is
	/// drained.
	fn next_batch(&self, wait: Duration) -> Option<Vec<EvictRequest>> {
		let mut state = self.state.lock();
		loop {
			if !state.requests.is_empty() || state.woken {
				state.woken = false;
				self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
				return Some(state.requests.drain(..).collect());
			}
			if self.shutdown.load(Ordering::Acquire) {
				return None;
			}
			if self.wake.wait_for(&mut state, wait).timed_out() {
				trace!("Eviction server timed out waiting for work");
			}
		}
	}

	fn shutdown(&self) {
		self.shutdown.store(true, Ordering::Release);
		let _state = self.state.lock();
		self.wake.notify_all();
	}
}

/// Handle through which serialized operations reach the eviction server.
#[derive(Debug, Clone)]
pub struct EvictHandle {
	queue: Arc<EvictQueue>,
}

impl EvictHandle {
	pub(crate) fn new(queue: Arc<EvictQueue>) -> Self {
		Self { queue }
	}
}

impl EvictApi for EvictHandle {
	fn is_page_oversized(&self, page: &Page) -> bool {
		page.size_estimate() > self.queue.page_max_size
	}

	fn schedule(&self, request: EvictRequest) {
		trace!("Scheduling eviction of {}", request.page.id());
		self.queue.push(request);
	}

	fn wake_server(&self) {
		self.queue.wake();
	}
}
