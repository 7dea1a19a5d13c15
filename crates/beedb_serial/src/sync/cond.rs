use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// Wait/signal pair owned by a single session.
///
/// The waiter re-checks its condition while holding `mutex`, and `signal`
/// takes the same mutex before notifying, so a signal sent between the check
/// and the wait cannot be lost.
#[derive(Debug, Default)]
pub(crate) struct SessionCond {
	mutex: Mutex<()>,
	cond: Condvar,
	signals: AtomicU64,
}

impl SessionCond {
	pub fn new() -> Self {
		Self::default()
	}

	/// Blocks the current thread for as long as `blocked` returns `true`.
	pub fn wait_while(&self, mut blocked: impl FnMut() -> bool) {
		let mut guard = self.mutex.lock();
		while blocked() {
			self.cond.wait(&mut guard);
		}
	}

	/// Wakes the waiting thread, if there is one. Returns whether a thread was
	/// woken.
	pub fn signal(&self) -> bool {
		let _guard = self.mutex.lock();
		self.signals.fetch_add(1, Ordering::Relaxed);
		self.cond.notify_one()
	}

	/// Total number of signals sent through this condition.
	pub fn signals(&self) -> u64 {
		self.signals.load(Ordering::Relaxed)
	}
}
