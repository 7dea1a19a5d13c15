use std::{any::Any, io, marker::PhantomData, ops::Deref, sync::Arc};

use log::{info, trace};
use static_assertions::{assert_impl_all, assert_not_impl_any};
use thiserror::Error;

use crate::{
	cache::{PageCache, PageCacheConfig},
	evict::{DiscardWriter, EvictConfig, EvictHandle, EvictQueue, EvictServer, EvictStats, EvictWriter},
	ops::{self, UpdateArgs},
	page::{Page, PageId},
	serial::{Critical, SerialOp, Serializer},
	session::{OpError, OpResult, Session, SessionRegistry},
	sync::{LockStats, SerialConfig},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("The current thread already has a session on this connection")]
	SessionExists,

	#[error("Failed to start the eviction server: {0}")]
	SpawnServer(#[from] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfig {
	pub serial: SerialConfig,
	pub evict: EvictConfig,
	pub cache: PageCacheConfig,
}

/// A thread's session on a connection. Detaches the session when dropped.
pub struct SessionHandle<'c> {
	session: Arc<Session>,
	registry: &'c SessionRegistry,
	_marker: PhantomData<*const ()>,
}
assert_not_impl_any!(SessionHandle<'static>: Send, Sync);

impl Deref for SessionHandle<'_> {
	type Target = Arc<Session>;

	fn deref(&self) -> &Self::Target {
		&self.session
	}
}

impl Drop for SessionHandle<'_> {
	fn drop(&mut self) {
		self.registry.detach(&self.session);
	}
}

/// Shared state of a database connection: the page cache, the execution lock
/// that serializes changes to it, and the eviction server.
pub struct Connection {
	serializer: Arc<Serializer<EvictHandle>>,
	queue: Arc<EvictQueue>,
	cache: Arc<PageCache>,
	sessions: SessionRegistry,
	server: EvictServer,
}
assert_impl_all!(Connection: Send, Sync);

impl Connection {
	pub fn open(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
		Self::open_with_writer(config, DiscardWriter)
	}

	/// Opens a connection whose eviction server hands modified pages to
	/// `writer`.
	pub fn open_with_writer<W: EvictWriter>(
		config: &ConnectionConfig,
		writer: W,
	) -> Result<Self, ConnectionError> {
		let queue = Arc::new(EvictQueue::new(&config.evict));
		let serializer = Arc::new(Serializer::new(
			&config.serial,
			EvictHandle::new(Arc::clone(&queue)),
		));
		let cache = Arc::new(PageCache::new(&config.cache));
		let server = EvictServer::spawn(
			&config.evict,
			Arc::clone(&queue),
			Arc::clone(&serializer),
			Arc::clone(&cache),
			writer,
		)?;
		info!("Opened connection");
		Ok(Self {
			serializer,
			queue,
			cache,
			sessions: SessionRegistry::new(),
			server,
		})
	}

	/// Attaches the current thread to the connection.
	pub fn open_session(&self) -> Result<SessionHandle<'_>, ConnectionError> {
		let session = self
			.sessions
			.attach()
			.ok_or(ConnectionError::SessionExists)?;
		Ok(SessionHandle {
			session,
			registry: &self.sessions,
			_marker: PhantomData,
		})
	}

	pub fn session_count(&self) -> usize {
		self.sessions.len()
	}

	/// The session the current thread has open, if any.
	pub fn current_session(&self) -> Option<Arc<Session>> {
		self.sessions.current()
	}

	/// Returns the cached page, loading an empty one if it is not in memory.
	pub fn page(&self, id: PageId) -> Arc<Page> {
		self.cache.get_or_insert(id)
	}

	pub fn cached_page(&self, id: PageId) -> Option<Arc<Page>> {
		self.cache.get(id)
	}

	pub fn cached_pages(&self) -> usize {
		self.cache.len()
	}

	/// See [`Serializer::serialize`].
	pub fn serialize<A, F>(&self, session: &Arc<Session>, op: SerialOp<'_>, func: F, args: A) -> OpResult
	where
		A: Any + Send,
		F: FnOnce(&Critical<'_, EvictHandle>),
	{
		self.serializer.serialize(session, op, func, args)
	}

	/// Writes `value` to a slot of the page, retrying if the page changes or
	/// is evicted before the write gets the execution lock.
	pub fn update_page(&self, session: &Arc<Session>, id: PageId, slot: usize, value: u64) -> OpResult {
		loop {
			let page = self.page(id);
			let write_gen = page.write_generation();
			let args = UpdateArgs {
				page,
				slot,
				value,
				write_gen,
			};
			match self.serialize(session, SerialOp::Func, ops::update_page, args) {
				Err(OpError::Restart) => trace!("Restarting update of {id}"),
				result => return result,
			}
		}
	}

	pub fn mark_dirty(&self, session: &Arc<Session>, page: &Arc<Page>) -> OpResult {
		self.serialize(session, SerialOp::Func, ops::mark_dirty, Arc::clone(page))
	}

	/// Evicts the page and waits until the eviction server is done with it.
	pub fn evict_page(&self, session: &Arc<Session>, id: PageId) -> OpResult {
		let Some(page) = self.cache.get(id) else {
			return Ok(());
		};
		self.serialize(session, SerialOp::Evict, ops::request_eviction, page)
	}

	#[inline]
	pub fn lock_stats(&self) -> &LockStats {
		self.serializer.lock_stats()
	}

	#[inline]
	pub fn evict_stats(&self) -> &EvictStats {
		self.queue.stats()
	}

	/// Eviction requests the server has not picked up yet.
	pub fn pending_evictions(&self) -> usize {
		self.queue.len()
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.server.shutdown();
		info!("Closed connection");
	}
}

#[cfg(test)]
mod tests {
	use std::{
		panic::{self, AssertUnwindSafe},
		thread,
		time::Duration,
	};

	use crate::utils::test_helpers::page_id;

	use super::*;

	fn connection() -> Connection {
		Connection::open(&ConnectionConfig {
			evict: EvictConfig {
				server_wait: Duration::from_millis(5),
				..Default::default()
			},
			cache: PageCacheConfig { page_slots: 4 },
			..Default::default()
		})
		.unwrap()
	}

	#[test]
	fn one_session_per_thread() {
		// given
		let conn = connection();
		let session = conn.open_session().unwrap();

		// when
		let second = conn.open_session();

		// then
		assert!(matches!(second, Err(ConnectionError::SessionExists)));
		assert_eq!(conn.session_count(), 1);
		assert_eq!(conn.current_session().unwrap().id(), session.id());
		drop(session);
		assert_eq!(conn.session_count(), 0);
		assert!(conn.current_session().is_none());
	}

	#[test]
	fn panicking_function_releases_session_and_lock() {
		// given
		let conn = connection();

		// when
		let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
			let session = conn.open_session().unwrap();
			conn.serialize(&session, SerialOp::Func, |_| panic!("function failed"), ())
		}));

		// then
		assert!(outcome.is_err());
		assert_eq!(conn.session_count(), 0);
		let session = conn.open_session().unwrap();
		assert_eq!(conn.mark_dirty(&session, &conn.page(page_id!(1))), Ok(()));
	}

	#[test]
	fn sessions_on_other_threads() {
		// given
		let conn = connection();
		let _session = conn.open_session().unwrap();

		// when
		let remote_count = thread::scope(|scope| {
			scope
				.spawn(|| {
					let _session = conn.open_session().unwrap();
					conn.session_count()
				})
				.join()
				.unwrap()
		});

		// then
		assert_eq!(remote_count, 2);
		assert_eq!(conn.session_count(), 1);
	}

	#[test]
	fn update_page_writes_value() {
		// given
		let conn = connection();
		let session = conn.open_session().unwrap();

		// when
		conn.update_page(&session, page_id!(1), 2, 69).unwrap();
		conn.update_page(&session, page_id!(1), 3, 420).unwrap();

		// then
		let page = conn.page(page_id!(1));
		assert_eq!(page.read(2), Some(69));
		assert_eq!(page.read(3), Some(420));
		assert_eq!(page.write_generation(), 2);
		assert_eq!(conn.lock_stats().acquisitions(), 2);
	}

	#[test]
	fn update_page_after_eviction_uses_fresh_page() {
		// given
		let conn = connection();
		let session = conn.open_session().unwrap();
		conn.update_page(&session, page_id!(1), 0, 1).unwrap();
		let old = conn.page(page_id!(1));

		// when
		conn.evict_page(&session, page_id!(1)).unwrap();
		conn.update_page(&session, page_id!(1), 0, 2).unwrap();

		// then
		let new = conn.page(page_id!(1));
		assert!(!old.is_live());
		assert!(!Arc::ptr_eq(&old, &new));
		assert_eq!(new.read(0), Some(2));
		assert_eq!(conn.evict_stats().evicted(), 1);
	}

	#[test]
	fn evict_uncached_page_is_a_noop() {
		// given
		let conn = connection();
		let session = conn.open_session().unwrap();

		// when
		let result = conn.evict_page(&session, page_id!(69));

		// then
		assert_eq!(result, Ok(()));
		assert_eq!(conn.evict_stats().scheduled(), 0);
	}

	#[test]
	fn mark_dirty_publishes_modification() {
		// given
		let conn = connection();
		let session = conn.open_session().unwrap();
		let page = conn.page(page_id!(1));

		// when
		let result = conn.mark_dirty(&session, &page);

		// then
		assert_eq!(result, Ok(()));
		assert!(page.is_modified());
		assert_eq!(page.write_generation(), 1);
	}
}
