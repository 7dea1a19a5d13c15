use std::{
	hint,
	marker::PhantomData,
	ptr,
	sync::atomic::{AtomicBool, AtomicU64, Ordering},
	thread,
	time::{Duration, Instant},
};

use log::warn;
use parking_lot::lock_api::{GuardNoSend, RawMutex};
use static_assertions::{assert_impl_all, assert_not_impl_any};

use crate::consts::{DEFAULT_MAX_HOLD, DEFAULT_SPIN_LIMIT};

pub(crate) mod cond;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
	/// Holding the execution lock longer than this is reported as a slow hold.
	pub max_hold: Duration,

	/// Busy-wait iterations on a contended lock before yielding the thread.
	pub spin_limit: u32,
}

impl Default for SerialConfig {
	fn default() -> Self {
		Self {
			max_hold: DEFAULT_MAX_HOLD,
			spin_limit: DEFAULT_SPIN_LIMIT,
		}
	}
}

/// A test-and-test-and-set spinlock.
pub(crate) struct RawSpinLock {
	locked: AtomicBool,
}

// Safety: `locked` is only set by a successful acquire and only cleared by
// `unlock`, which the caller must only call while owning the lock.
unsafe impl RawMutex for RawSpinLock {
	#[allow(clippy::declare_interior_mutable_const)]
	const INIT: Self = Self {
		locked: AtomicBool::new(false),
	};

	type GuardMarker = GuardNoSend;

	fn lock(&self) {
		while !self.try_lock() {
			while self.is_locked() {
				hint::spin_loop();
			}
		}
	}

	fn try_lock(&self) -> bool {
		self.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
	}

	unsafe fn unlock(&self) {
		self.locked.store(false, Ordering::Release);
	}

	fn is_locked(&self) -> bool {
		self.locked.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Default)]
pub struct LockStats {
	acquisitions: AtomicU64,
	contended: AtomicU64,
	slow_holds: AtomicU64,
}

impl LockStats {
	pub fn acquisitions(&self) -> u64 {
		self.acquisitions.load(Ordering::Relaxed)
	}

	/// Acquisitions that found the lock already held.
	pub fn contended(&self) -> u64 {
		self.contended.load(Ordering::Relaxed)
	}

	/// Critical sections that held the lock for longer than
	/// [`SerialConfig::max_hold`].
	pub fn slow_holds(&self) -> u64 {
		self.slow_holds.load(Ordering::Relaxed)
	}
}

/// The connection-wide execution lock.
///
/// Critical sections are expected to be microseconds long, so waiters spin
/// instead of parking. After `spin_limit` iterations a waiter starts yielding
/// its time slice between checks.
pub(crate) struct SerialLock {
	raw: RawSpinLock,
	max_hold: Duration,
	spin_limit: u32,
	stats: LockStats,
}
assert_impl_all!(SerialLock: Send, Sync);

impl SerialLock {
	pub fn new(config: &SerialConfig) -> Self {
		Self {
			raw: RawSpinLock::INIT,
			max_hold: config.max_hold,
			spin_limit: config.spin_limit,
			stats: LockStats::default(),
		}
	}

	pub fn lock(&self) -> SerialGuard<'_> {
		if !self.raw.try_lock() {
			self.stats.contended.fetch_add(1, Ordering::Relaxed);
			self.lock_contended();
		}
		self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
		SerialGuard {
			lock: self,
			acquired: Instant::now(),
			_marker: PhantomData,
		}
	}

	#[cfg(test)]
	pub fn is_locked(&self) -> bool {
		self.raw.is_locked()
	}

	#[inline]
	pub fn stats(&self) -> &LockStats {
		&self.stats
	}

	fn lock_contended(&self) {
		let mut spins: u32 = 0;
		loop {
			while self.raw.is_locked() {
				if spins < self.spin_limit {
					spins += 1;
					hint::spin_loop();
				} else {
					thread::yield_now();
				}
			}
			if self.raw.try_lock() {
				return;
			}
		}
	}
}

/// Proof that the current thread holds the execution lock.
///
/// Dropping the guard releases the lock. A reference to the guard is the
/// token required for re-entrant serialized calls.
#[must_use = "The execution lock is released right after acquiring it"]
pub struct SerialGuard<'a> {
	lock: &'a SerialLock,
	acquired: Instant,
	_marker: PhantomData<*const ()>,
}
assert_not_impl_any!(SerialGuard<'static>: Send, Sync);

impl<'a> SerialGuard<'a> {
	pub(crate) fn guards(&self, lock: &SerialLock) -> bool {
		ptr::eq(self.lock, lock)
	}

	/// How long the lock has been held so far.
	pub fn held_for(&self) -> Duration {
		self.acquired.elapsed()
	}
}

impl<'a> Drop for SerialGuard<'a> {
	fn drop(&mut self) {
		let held = self.held_for();
		if held > self.lock.max_hold {
			self.lock.stats.slow_holds.fetch_add(1, Ordering::Relaxed);
			warn!(
				"Execution lock was held for {held:?}, exceeding the limit of {:?}",
				self.lock.max_hold
			);
		}
		// Safety: the existence of this object guarantees the lock is owned by the
		// current context
		unsafe { self.lock.raw.unlock() };
	}
}
