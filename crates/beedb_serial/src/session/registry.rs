use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	thread::{self, ThreadId},
};

use log::{debug, warn};
use parking_lot::RwLock;

use super::{Session, SessionId, SessionState};

/// The sessions of all threads attached to a connection, keyed by thread.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
	next_id: AtomicU64,
	sessions: RwLock<HashMap<ThreadId, Arc<Session>>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Attaches the current thread. Returns `None` if it already has a session.
	pub fn attach(&self) -> Option<Arc<Session>> {
		let thread = thread::current().id();
		let mut sessions = self.sessions.write();
		if sessions.contains_key(&thread) {
			return None;
		}
		let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
		let session = Arc::new(Session::new(id, thread));
		sessions.insert(thread, Arc::clone(&session));
		debug!("Attached {id} to thread {thread:?}");
		Some(session)
	}

	/// Removes the session. A session may only be detached mid-operation while
	/// its thread unwinds from a panic in a serialized function.
	pub fn detach(&self, session: &Session) {
		if thread::panicking() {
			warn!(
				"{} was detached during a panic in state {:?}",
				session.id(),
				session.state()
			);
		} else {
			assert_eq!(
				session.state(),
				SessionState::Idle,
				"{} was detached with an operation in flight",
				session.id()
			);
		}
		let removed = self.sessions.write().remove(&session.thread());
		debug_assert!(removed.is_some_and(|s| s.id() == session.id()));
		debug!("Detached {} from thread {:?}", session.id(), session.thread());
	}

	pub fn current(&self) -> Option<Arc<Session>> {
		self.sessions.read().get(&thread::current().id()).cloned()
	}

	pub fn len(&self) -> usize {
		self.sessions.read().len()
	}
}
