use std::{
	fmt,
	sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use static_assertions::assert_impl_all;

use crate::{
	consts::{PAGE_BASE_SIZE, UPDATE_SIZE},
	session::OpError,
	sync::SerialGuard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u64);

impl PageId {
	#[inline]
	pub const fn new(id: u64) -> Self {
		Self(id)
	}

	#[inline]
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for PageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "page {}", self.0)
	}
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
	Live = 0,
	Evicted = 1,
}

impl PageState {
	fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Live,
			1 => Self::Evicted,
			_ => unreachable!("Invalid page state {raw}"),
		}
	}
}

/// A point-in-time copy of a page's body.
///
/// `values` reflects at least every write that was published with
/// `write_generation`, possibly more recent ones too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
	pub id: PageId,
	pub write_generation: u64,
	pub modified: bool,
	pub values: Vec<u64>,
}

/// A cached page shared between all sessions that reference it.
///
/// The body may only be mutated while holding the execution lock, which
/// `write_slot` enforces by requiring the lock guard. Readers never take the
/// lock; they key their reads on `write_generation` instead.
#[derive(Debug)]
pub struct Page {
	id: PageId,
	state: AtomicU8,
	modified: AtomicBool,
	write_gen: AtomicU64,
	size: AtomicUsize,
	evict_scheduled: AtomicBool,
	slots: Box<[AtomicU64]>,
}
assert_impl_all!(Page: Send, Sync);

impl Page {
	pub fn new(id: PageId, num_slots: usize) -> Self {
		Self {
			id,
			state: AtomicU8::new(PageState::Live as u8),
			modified: AtomicBool::new(false),
			write_gen: AtomicU64::new(0),
			size: AtomicUsize::new(PAGE_BASE_SIZE),
			evict_scheduled: AtomicBool::new(false),
			slots: std::iter::repeat_with(|| AtomicU64::new(0))
				.take(num_slots)
				.collect(),
		}
	}

	#[inline]
	pub fn id(&self) -> PageId {
		self.id
	}

	#[inline]
	pub fn num_slots(&self) -> usize {
		self.slots.len()
	}

	#[inline]
	pub fn write_generation(&self) -> u64 {
		self.write_gen.load(Ordering::Acquire)
	}

	#[inline]
	pub fn is_modified(&self) -> bool {
		self.modified.load(Ordering::Acquire)
	}

	#[inline]
	pub fn size_estimate(&self) -> usize {
		self.size.load(Ordering::Relaxed)
	}

	#[inline]
	pub fn state(&self) -> PageState {
		PageState::from_raw(self.state.load(Ordering::Acquire))
	}

	#[inline]
	pub fn is_live(&self) -> bool {
		self.state() == PageState::Live
	}

	pub fn read(&self, slot: usize) -> Option<u64> {
		// The slot is at least as new as the generation acquired here.
		let _ = self.write_gen.load(Ordering::Acquire);
		Some(self.slots.get(slot)?.load(Ordering::Relaxed))
	}

	pub fn snapshot(&self) -> PageSnapshot {
		let write_generation = self.write_gen.load(Ordering::Acquire);
		let modified = self.modified.load(Ordering::Acquire);
		PageSnapshot {
			id: self.id,
			write_generation,
			modified,
			values: self
				.slots
				.iter()
				.map(|slot| slot.load(Ordering::Relaxed))
				.collect(),
		}
	}

	/// Writes a slot of the page body. The write becomes visible to readers
	/// once the page is marked modified by the completion of the operation.
	pub fn write_slot(
		&self,
		_guard: &SerialGuard<'_>,
		slot: usize,
		value: u64,
	) -> Result<(), OpError> {
		let Some(slot) = self.slots.get(slot) else {
			return Err(OpError::InvalidArgument);
		};
		slot.store(value, Ordering::Relaxed);
		self.size.fetch_add(UPDATE_SIZE, Ordering::Relaxed);
		Ok(())
	}

	/// Bumps the write generation, then flags the page as modified. Returns the
	/// new write generation.
	pub(crate) fn set_modified(&self) -> u64 {
		let write_gen = self.write_gen.fetch_add(1, Ordering::Release) + 1;
		self.modified.store(true, Ordering::Release);
		write_gen
	}

	pub(crate) fn clear_modified(&self) {
		self.modified.store(false, Ordering::Release);
	}

	pub(crate) fn mark_evicted(&self) {
		self.state
			.store(PageState::Evicted as u8, Ordering::Release);
	}

	/// Returns `true` if no eviction was scheduled for this page before.
	pub(crate) fn try_schedule_eviction(&self) -> bool {
		!self.evict_scheduled.swap(true, Ordering::AcqRel)
	}

	/// Whether a forced eviction is pending for this page.
	pub fn eviction_scheduled(&self) -> bool {
		self.evict_scheduled.load(Ordering::Acquire)
	}

	/// Allows another forced eviction after a failed one.
	pub(crate) fn cancel_scheduled_eviction(&self) {
		self.evict_scheduled.store(false, Ordering::Release);
	}
}
