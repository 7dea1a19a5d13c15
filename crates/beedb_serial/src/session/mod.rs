use std::{
	any::{self, Any},
	fmt, mem,
	num::NonZeroI32,
	sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
	thread::{self, ThreadId},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::sync::cond::SessionCond;

pub(crate) use registry::SessionRegistry;

mod registry;

const RESTART_CODE: i32 = -31_800;
const BUSY_CODE: i32 = -31_801;
const INVALID_ARGUMENT_CODE: i32 = -31_802;

/// The failure of a serialized operation, as published to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OpError {
	#[error("The page changed since it was read; the operation must be restarted")]
	Restart,

	#[error("The page is in use and cannot be evicted right now")]
	Busy,

	#[error("A serialized operation received an invalid argument")]
	InvalidArgument,

	#[error("A serialized operation failed with code {0}")]
	Code(NonZeroI32),
}

pub type OpResult = Result<(), OpError>;

impl OpError {
	pub fn code(self) -> i32 {
		match self {
			Self::Restart => RESTART_CODE,
			Self::Busy => BUSY_CODE,
			Self::InvalidArgument => INVALID_ARGUMENT_CODE,
			Self::Code(code) => code.get(),
		}
	}

	/// Decodes a result code; `0` means success. The reserved codes of
	/// `Restart`, `Busy` and `InvalidArgument` decode to those variants.
	pub fn from_code(code: i32) -> OpResult {
		match code {
			RESTART_CODE => Err(Self::Restart),
			BUSY_CODE => Err(Self::Busy),
			INVALID_ARGUMENT_CODE => Err(Self::InvalidArgument),
			code => match NonZeroI32::new(code) {
				Some(code) => Err(Self::Code(code)),
				None => Ok(()),
			},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
	#[inline]
	pub(crate) const fn new(id: u64) -> Self {
		Self(id)
	}

	#[inline]
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "session {}", self.0)
	}
}

/// The kind of serialized operation a session currently has scheduled.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqState {
	None = 0,
	Func = 1,
	Evict = 2,
	Reenter = 3,
}

impl WqState {
	fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::None,
			1 => Self::Func,
			2 => Self::Evict,
			3 => Self::Reenter,
			_ => unreachable!("Invalid session queue state {raw}"),
		}
	}
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Idle = 0,
	Pending = 1,
	Executing = 2,
	Completed = 3,
}

impl SessionState {
	fn from_raw(raw: u8) -> Self {
		match raw {
			0 => Self::Idle,
			1 => Self::Pending,
			2 => Self::Executing,
			3 => Self::Completed,
			_ => unreachable!("Invalid session state {raw}"),
		}
	}
}

/// Outer operation state saved while a re-entrant call runs on the same
/// session.
pub(crate) struct Frame {
	args: Option<Box<dyn Any + Send>>,
	wq_state: u8,
	done: bool,
}

/// Per-thread execution context. Carries at most one serialized operation at
/// a time.
///
/// `wq_state` is the handoff flag: whoever completes the operation stores
/// `result` first and then stores `WqState::None` with release ordering. The
/// caller only reads `result` after observing `WqState::None` with acquire
/// ordering.
pub struct Session {
	id: SessionId,
	thread: ThreadId,
	state: AtomicU8,
	wq_state: AtomicU8,
	sleeping: AtomicBool,
	result: Mutex<OpResult>,
	depth: AtomicU32,
	frame_done: AtomicBool,
	pending: Mutex<Option<Box<dyn Any + Send>>>,
	cond: SessionCond,
}
assert_impl_all!(Session: Send, Sync);

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.id)
			.field("thread", &self.thread)
			.field("state", &self.state())
			.field("wq_state", &self.wq_state())
			.field("sleeping", &self.is_sleeping())
			.field("depth", &self.depth())
			.finish_non_exhaustive()
	}
}

impl Session {
	pub(crate) fn new(id: SessionId, thread: ThreadId) -> Self {
		Self {
			id,
			thread,
			state: AtomicU8::new(SessionState::Idle as u8),
			wq_state: AtomicU8::new(WqState::None as u8),
			sleeping: AtomicBool::new(false),
			result: Mutex::new(Ok(())),
			depth: AtomicU32::new(0),
			frame_done: AtomicBool::new(false),
			pending: Mutex::new(None),
			cond: SessionCond::new(),
		}
	}

	#[inline]
	pub fn id(&self) -> SessionId {
		self.id
	}

	#[inline]
	pub fn thread(&self) -> ThreadId {
		self.thread
	}

	#[inline]
	pub fn state(&self) -> SessionState {
		SessionState::from_raw(self.state.load(Ordering::Acquire))
	}

	#[inline]
	pub fn wq_state(&self) -> WqState {
		WqState::from_raw(self.wq_state.load(Ordering::Acquire))
	}

	#[inline]
	pub fn is_sleeping(&self) -> bool {
		self.sleeping.load(Ordering::Acquire)
	}

	/// Number of re-entrant frames currently open on this session.
	#[inline]
	pub fn depth(&self) -> u32 {
		self.depth.load(Ordering::Acquire)
	}

	/// Number of completion signals sent to this session. Every completion of a
	/// sleeping operation sends one, whether or not the thread had to wait.
	#[inline]
	pub fn wakeups(&self) -> u64 {
		self.cond.signals()
	}

	/// Takes the payload of the operation currently executing on this session.
	///
	/// # Panics
	/// If the payload was already taken, or is not a `T`.
	pub fn take_args<T: Any>(&self) -> T {
		let args = self
			.pending
			.lock()
			.take()
			.unwrap_or_else(|| panic!("{} has no pending arguments", self.id));
		match args.downcast::<T>() {
			Ok(args) => *args,
			Err(_) => panic!(
				"{} has pending arguments of a type other than {}",
				self.id,
				any::type_name::<T>()
			),
		}
	}

	pub(crate) fn begin(&self, kind: WqState, args: Box<dyn Any + Send>) {
		self.assert_owner();
		if let Err(state) = self.state.compare_exchange(
			SessionState::Idle as u8,
			SessionState::Pending as u8,
			Ordering::AcqRel,
			Ordering::Acquire,
		) {
			panic!(
				"{} already has an operation in flight ({:?})",
				self.id,
				SessionState::from_raw(state)
			);
		}
		*self.pending.lock() = Some(args);
		self.sleeping
			.store(kind == WqState::Evict, Ordering::Release);
		self.wq_state.store(kind as u8, Ordering::Release);
	}

	pub(crate) fn start(&self) {
		self.transition(SessionState::Pending, SessionState::Executing);
	}

	/// Publishes the result of the innermost operation running on this session
	/// and wakes its thread if it sleeps.
	///
	/// # Panics
	/// If the operation was already completed.
	pub(crate) fn publish(&self, result: OpResult) {
		if self.depth.load(Ordering::Acquire) > 0 {
			self.publish_frame(result);
			return;
		}

		self.transition(SessionState::Executing, SessionState::Completed);
		// Read before publishing; once `wq_state` is `None` the owner may already be
		// starting its next cycle.
		let sleeping = self.sleeping.load(Ordering::Acquire);
		*self.result.lock() = result;
		self.wq_state
			.store(WqState::None as u8, Ordering::Release);

		if sleeping {
			self.cond.signal();
		}
	}

	pub(crate) fn is_published(&self) -> bool {
		self.wq_state.load(Ordering::Acquire) == WqState::None as u8
	}

	/// Blocks until the current operation has been published.
	pub(crate) fn wait(&self) {
		self.cond.wait_while(|| !self.is_published());
	}

	/// Reads the published result and returns the session to `Idle`.
	pub(crate) fn finish(&self) -> OpResult {
		debug_assert!(self.is_published());
		let result = self.take_result();
		self.pending.lock().take();
		self.sleeping.store(false, Ordering::Release);
		self.transition(SessionState::Completed, SessionState::Idle);
		result
	}

	pub(crate) fn enter_frame(&self, args: Box<dyn Any + Send>) -> Frame {
		self.assert_owner();
		let state = self.state();
		assert_eq!(
			state,
			SessionState::Executing,
			"Re-entrant call on {} outside of an executing operation",
			self.id
		);
		let frame = Frame {
			args: self.pending.lock().replace(args),
			wq_state: self
				.wq_state
				.swap(WqState::Reenter as u8, Ordering::AcqRel),
			done: self.frame_done.swap(false, Ordering::AcqRel),
		};
		self.depth.fetch_add(1, Ordering::AcqRel);
		frame
	}

	/// Closes the innermost re-entrant frame and restores the outer operation.
	///
	/// # Panics
	/// If the frame's function returned without publishing a result.
	pub(crate) fn leave_frame(&self, frame: Frame) -> OpResult {
		assert!(
			self.frame_done.load(Ordering::Acquire),
			"Re-entrant function on {} returned without completing",
			self.id
		);
		let result = self.take_result();
		self.depth.fetch_sub(1, Ordering::AcqRel);
		*self.pending.lock() = frame.args;
		self.frame_done.store(frame.done, Ordering::Release);
		self.wq_state.store(frame.wq_state, Ordering::Release);
		result
	}

	fn publish_frame(&self, result: OpResult) {
		assert!(
			!self.frame_done.swap(true, Ordering::AcqRel),
			"Re-entrant operation on {} was completed twice",
			self.id
		);
		*self.result.lock() = result;
		self.wq_state
			.store(WqState::None as u8, Ordering::Release);
	}

	fn take_result(&self) -> OpResult {
		mem::replace(&mut *self.result.lock(), Ok(()))
	}

	fn transition(&self, from: SessionState, to: SessionState) {
		if let Err(state) =
			self.state
				.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
		{
			panic!(
				"{} cannot move from {from:?} to {to:?}, it is {:?}",
				self.id,
				SessionState::from_raw(state)
			);
		}
	}

	fn assert_owner(&self) {
		assert_eq!(
			thread::current().id(),
			self.thread,
			"{} was used from a thread it is not attached to",
			self.id
		);
	}
}
