use std::{
	num::NonZeroI32,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	thread,
	time::Duration,
};

use beedb_serial::{
	ops, Connection, ConnectionConfig, EvictConfig, EvictWriter, OpError, OpResult, PageCacheConfig,
	PageId, PageSnapshot, SerialOp, SessionState,
};
use parking_lot::Mutex;

fn config() -> ConnectionConfig {
	ConnectionConfig {
		evict: EvictConfig {
			server_wait: Duration::from_millis(5),
			..Default::default()
		},
		cache: PageCacheConfig { page_slots: 4 },
		..Default::default()
	}
}

fn code(code: i32) -> OpError {
	OpError::Code(NonZeroI32::new(code).unwrap())
}

#[derive(Clone, Default)]
struct RecordingWriter {
	written: Arc<Mutex<Vec<PageSnapshot>>>,
}

impl EvictWriter for RecordingWriter {
	fn write_page(&self, snapshot: &PageSnapshot) -> OpResult {
		self.written.lock().push(snapshot.clone());
		Ok(())
	}
}

#[test]
fn critical_sections_never_overlap() {
	// given
	const THREADS: u64 = 8;
	const ITERATIONS: u64 = 500;
	let conn = Connection::open(&config()).unwrap();
	let counter = AtomicU64::new(0);
	let inside = AtomicBool::new(false);

	// when
	thread::scope(|scope| {
		for _ in 0..THREADS {
			scope.spawn(|| {
				let session = conn.open_session().unwrap();
				for _ in 0..ITERATIONS {
					conn.serialize(
						&session,
						SerialOp::Func,
						|ctx| {
							assert!(!inside.swap(true, Ordering::Relaxed));
							let value = counter.load(Ordering::Relaxed);
							counter.store(value + 1, Ordering::Relaxed);
							inside.store(false, Ordering::Relaxed);
							ctx.complete(None, Ok(()));
						},
						(),
					)
					.unwrap();
				}
			});
		}
	});

	// then
	assert_eq!(counter.load(Ordering::Relaxed), THREADS * ITERATIONS);
	assert_eq!(conn.session_count(), 0);
}

#[test]
fn concurrent_evict_calls_mark_distinct_pages() {
	// given
	let conn = Connection::open(&config()).unwrap();

	// when
	thread::scope(|scope| {
		for i in 0..10 {
			let conn = &conn;
			scope.spawn(move || {
				let session = conn.open_session().unwrap();
				let page = conn.page(PageId::new(i));
				let result = conn.serialize(&session, SerialOp::Evict, ops::mark_dirty, page);
				assert_eq!(result, Ok(()));
				assert_eq!(session.state(), SessionState::Idle);
			});
		}
	});

	// then
	for i in 0..10 {
		let page = conn.page(PageId::new(i));
		assert!(page.is_modified());
		assert_eq!(page.write_generation(), 1);
	}
}

#[test]
fn failure_is_returned_without_marking_page() {
	// given
	let conn = Connection::open(&config()).unwrap();
	let session = conn.open_session().unwrap();
	let page = conn.page(PageId::new(1));

	// when
	let result = conn.serialize(
		&session,
		SerialOp::Func,
		|ctx| ctx.complete(Some(&page), Err(code(5))),
		(),
	);

	// then
	assert_eq!(result, Err(code(5)));
	assert!(!page.is_modified());
	assert_eq!(page.write_generation(), 0);
}

#[test]
fn reserved_failure_codes_reach_the_caller() {
	// given
	let conn = Connection::open(&config()).unwrap();
	let session = conn.open_session().unwrap();

	for raw in [-31_800, -31_801, -31_802] {
		// when
		let result = conn.serialize(
			&session,
			SerialOp::Func,
			|ctx| ctx.complete(None, Err(code(raw))),
			(),
		);

		// then
		assert_eq!(result, Err(code(raw)));
	}
}

#[test]
fn readers_see_writes_of_observed_generation() {
	// given
	const WRITES: u64 = 1000;
	let conn = Connection::open(&config()).unwrap();
	let page = conn.page(PageId::new(1));

	// when
	thread::scope(|scope| {
		scope.spawn(|| {
			let session = conn.open_session().unwrap();
			for n in 1..=WRITES {
				let result = conn.serialize(
					&session,
					SerialOp::Func,
					|ctx| {
						let result = page
							.write_slot(ctx.guard(), 0, n)
							.and_then(|()| page.write_slot(ctx.guard(), 1, n));
						ctx.complete(Some(&page), result);
					},
					(),
				);
				assert_eq!(result, Ok(()));
			}
		});
		scope.spawn(|| loop {
			let generation = page.write_generation();
			let first = page.read(0).unwrap();
			let second = page.read(1).unwrap();
			assert!(first >= generation, "slot 0 is {first} at generation {generation}");
			assert!(second >= generation, "slot 1 is {second} at generation {generation}");
			if generation == WRITES {
				break;
			}
		});
	});

	// then
	assert_eq!(page.read(0), Some(WRITES));
	assert_eq!(page.write_generation(), WRITES);
}

#[test]
fn reentrant_call_runs_inside_critical_section() {
	// given
	let conn = Connection::open(&config()).unwrap();
	let session = conn.open_session().unwrap();
	let page = conn.page(PageId::new(1));

	// when
	let result = conn.serialize(
		&session,
		SerialOp::Func,
		|ctx| {
			let inner = ctx.reenter(ctx.session(), ops::mark_dirty, Arc::clone(&page));
			assert_eq!(inner, Ok(()));
			assert_eq!(page.write_generation(), 1);
			ctx.complete(Some(&page), Err(OpError::Busy));
		},
		(),
	);

	// then
	assert_eq!(result, Err(OpError::Busy));
	assert_eq!(page.write_generation(), 1);
	assert_eq!(session.depth(), 0);
	assert_eq!(conn.lock_stats().acquisitions(), 1);
}

#[test]
fn eviction_server_wakes_sleeping_session() {
	// given
	let writer = RecordingWriter::default();
	let conn = Connection::open_with_writer(&config(), writer.clone()).unwrap();
	let session = conn.open_session().unwrap();
	conn.update_page(&session, PageId::new(1), 3, 69).unwrap();
	let page = conn.page(PageId::new(1));

	// when
	let result = conn.evict_page(&session, PageId::new(1));
	let pending = conn.pending_evictions();
	let cached = conn.cached_pages();
	let evicted_session = Arc::clone(&session);
	drop(session);
	drop(conn);

	// then
	assert_eq!(result, Ok(()));
	assert!(!page.is_live());
	assert_eq!(pending, 0);
	assert_eq!(cached, 0);
	assert_eq!(evicted_session.wakeups(), 1);
	assert_eq!(evicted_session.state(), SessionState::Idle);
	let written = writer.written.lock();
	assert_eq!(written.len(), 1);
	assert_eq!(written[0].values, [0, 0, 0, 69]);
}

#[test]
fn oversized_page_is_forced_out_once() {
	// given
	let writer = RecordingWriter::default();
	let empty_size = beedb_serial::Page::new(PageId::new(0), 1).size_estimate();
	let conn = Connection::open_with_writer(
		&ConnectionConfig {
			evict: EvictConfig {
				page_max_size: empty_size + 128,
				server_wait: Duration::from_millis(5),
			},
			..config()
		},
		writer.clone(),
	)
	.unwrap();
	let session = conn.open_session().unwrap();

	// when
	for value in 0..5 {
		conn.update_page(&session, PageId::new(1), 0, value).unwrap();
	}
	let forced = conn.evict_stats().forced();
	drop(session);
	drop(conn);

	// then
	assert_eq!(forced, 1);
	let written = writer.written.lock();
	assert_eq!(written.len(), 1);
	assert_eq!(written[0].id, PageId::new(1));
}
