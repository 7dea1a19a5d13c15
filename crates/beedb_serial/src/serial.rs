use std::{any::Any, sync::Arc};

use log::{debug, trace};

use crate::{
	evict::{EvictApi, EvictHandle, EvictRequest},
	page::Page,
	session::{OpResult, Session, SessionState, WqState},
	sync::{LockStats, SerialConfig, SerialGuard, SerialLock},
};

/// How a serialized call is scheduled.
#[derive(Clone, Copy)]
pub enum SerialOp<'g> {
	/// Runs under the execution lock and completes before the lock is released.
	Func,

	/// Runs under the execution lock, then wakes the eviction server. The
	/// caller sleeps until the operation is completed, which may happen on the
	/// server's thread.
	Evict,

	/// Runs inside a critical section that is already executing. The guard
	/// proves the lock is held, so it is not taken again.
	Reenter(&'g SerialGuard<'g>),
}

impl SerialOp<'_> {
	fn kind(&self) -> WqState {
		match self {
			Self::Func => WqState::Func,
			Self::Evict => WqState::Evict,
			Self::Reenter(..) => WqState::Reenter,
		}
	}
}

/// The serialization gateway: runs closures one at a time under the
/// connection-wide execution lock and hands their results back to the calling
/// session.
pub struct Serializer<E: EvictApi = EvictHandle> {
	lock: SerialLock,
	evict: E,
}

impl<E: EvictApi> Serializer<E> {
	pub(crate) fn new(config: &SerialConfig, evict: E) -> Self {
		Self {
			lock: SerialLock::new(config),
			evict,
		}
	}

	#[inline]
	pub fn lock_stats(&self) -> &LockStats {
		self.lock.stats()
	}

	pub(crate) fn lock(&self) -> SerialGuard<'_> {
		self.lock.lock()
	}

	/// Runs `func` with exclusive access to shared state on behalf of
	/// `session` and returns the result it published.
	///
	/// `func` must complete the operation through [`Critical::complete`],
	/// except for [`SerialOp::Evict`] calls, which may leave that to the
	/// eviction server.
	///
	/// # Panics
	/// - If `session` belongs to another thread or already has an operation in
	///   flight.
	/// - If a re-entrant call passes the guard of a different lock.
	/// - If `func` returns without completing an operation that cannot be
	///   completed elsewhere.
	pub fn serialize<A, F>(&self, session: &Arc<Session>, op: SerialOp<'_>, func: F, args: A) -> OpResult
	where
		A: Any + Send,
		F: FnOnce(&Critical<'_, E>),
	{
		let kind = op.kind();
		if let SerialOp::Reenter(guard) = op {
			assert!(
				guard.guards(&self.lock),
				"Re-entrant call on {} with the guard of another execution lock",
				session.id()
			);
			if session.state() == SessionState::Executing {
				return self.run_frame(session, guard, func, Box::new(args));
			}
		}

		session.begin(kind, Box::new(args));
		match op {
			SerialOp::Reenter(guard) => self.execute(session, guard, func),
			SerialOp::Func | SerialOp::Evict => {
				let guard = self.lock.lock();
				self.execute(session, &guard, func);
			}
		}

		if kind == WqState::Evict {
			self.evict.wake_server();
		}

		if !session.is_published() {
			assert!(
				session.is_sleeping(),
				"Serialized function on {} returned without completing",
				session.id()
			);
			trace!("{} is waiting for its operation to complete", session.id());
			session.wait();
		}
		session.finish()
	}

	/// Publishes the result of the operation running on `session`.
	///
	/// On success, `page` is marked modified before the result becomes
	/// visible, and eviction is forced if it grew too large.
	pub fn complete(&self, session: &Session, page: Option<&Arc<Page>>, result: OpResult) {
		if let (Ok(()), Some(page)) = (result, page) {
			let write_gen = page.set_modified();
			trace!("{} modified {} (write generation {write_gen})", session.id(), page.id());
			self.page_check(page);
		}
		session.publish(result);
	}

	fn page_check(&self, page: &Arc<Page>) {
		if self.evict.is_page_oversized(page) && page.try_schedule_eviction() {
			debug!(
				"{} grew to {} bytes, forcing eviction",
				page.id(),
				page.size_estimate()
			);
			self.evict.schedule(EvictRequest::forced(Arc::clone(page)));
			self.evict.wake_server();
		}
	}

	fn execute<F>(&self, session: &Arc<Session>, guard: &SerialGuard<'_>, func: F)
	where
		F: FnOnce(&Critical<'_, E>),
	{
		session.start();
		func(&Critical {
			serializer: self,
			session,
			guard,
		});
	}

	fn run_frame<F>(
		&self,
		session: &Arc<Session>,
		guard: &SerialGuard<'_>,
		func: F,
		args: Box<dyn Any + Send>,
	) -> OpResult
	where
		F: FnOnce(&Critical<'_, E>),
	{
		let frame = session.enter_frame(args);
		trace!("{} entered re-entrant frame {}", session.id(), session.depth());
		func(&Critical {
			serializer: self,
			session,
			guard,
		});
		session.leave_frame(frame)
	}
}

/// What a serialized function sees while it holds the execution lock.
pub struct Critical<'a, E: EvictApi = EvictHandle> {
	serializer: &'a Serializer<E>,
	session: &'a Arc<Session>,
	guard: &'a SerialGuard<'a>,
}

impl<'a, E: EvictApi> Critical<'a, E> {
	#[inline]
	pub fn session(&self) -> &'a Arc<Session> {
		self.session
	}

	/// The held execution lock. Needed to mutate page bodies.
	#[inline]
	pub fn guard(&self) -> &'a SerialGuard<'a> {
		self.guard
	}

	#[inline]
	pub fn evict(&self) -> &'a E {
		&self.serializer.evict
	}

	/// Takes the payload this call was scheduled with.
	pub fn take_args<T: Any>(&self) -> T {
		self.session.take_args()
	}

	pub fn complete(&self, page: Option<&Arc<Page>>, result: OpResult) {
		self.serializer.complete(self.session, page, result);
	}

	/// Serializes another call without giving up the execution lock.
	pub fn reenter<A, F>(&self, session: &Arc<Session>, func: F, args: A) -> OpResult
	where
		A: Any + Send,
		F: FnOnce(&Critical<'_, E>),
	{
		self.serializer
			.serialize(session, SerialOp::Reenter(self.guard), func, args)
	}
}
