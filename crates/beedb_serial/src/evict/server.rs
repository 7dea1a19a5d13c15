use std::{
	io,
	sync::{atomic::Ordering, Arc},
	thread::{self, JoinHandle},
	time::Duration,
};

use log::{debug, error, trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::{
	cache::PageCache,
	page::{Page, PageSnapshot},
	serial::Serializer,
	session::OpResult,
	sync::SerialGuard,
};

use super::{EvictConfig, EvictHandle, EvictQueue, EvictRequest};

/// Destination of modified pages leaving the cache.
#[cfg_attr(test, automock)]
pub trait EvictWriter: Send + 'static {
	fn write_page(&self, snapshot: &PageSnapshot) -> OpResult;
}

/// Drops page contents on eviction.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardWriter;

impl EvictWriter for DiscardWriter {
	fn write_page(&self, snapshot: &PageSnapshot) -> OpResult {
		trace!(
			"Discarding {} at write generation {}",
			snapshot.id,
			snapshot.write_generation
		);
		Ok(())
	}
}

/// The background thread that evicts pages and completes the operations
/// waiting on them.
pub(crate) struct EvictServer {
	queue: Arc<EvictQueue>,
	thread: Option<JoinHandle<()>>,
}

impl EvictServer {
	pub fn spawn<W: EvictWriter>(
		config: &EvictConfig,
		queue: Arc<EvictQueue>,
		serializer: Arc<Serializer<EvictHandle>>,
		cache: Arc<PageCache>,
		writer: W,
	) -> Result<Self, io::Error> {
		let worker = EvictWorker {
			queue: Arc::clone(&queue),
			serializer,
			cache,
			writer,
			wait: config.server_wait,
		};
		let thread = thread::Builder::new()
			.name("evict-server".to_string())
			.spawn(move || worker.run())?;
		Ok(Self {
			queue,
			thread: Some(thread),
		})
	}

	/// Stops the server after it has processed every queued request.
	pub fn shutdown(&mut self) {
		let Some(thread) = self.thread.take() else {
			return;
		};
		self.queue.shutdown();
		if thread.join().is_err() {
			error!("Eviction server panicked");
		}
	}
}

impl Drop for EvictServer {
	fn drop(&mut self) {
		self.shutdown();
	}
}

struct EvictWorker<W: EvictWriter> {
	queue: Arc<EvictQueue>,
	serializer: Arc<Serializer<EvictHandle>>,
	cache: Arc<PageCache>,
	writer: W,
	wait: Duration,
}

impl<W: EvictWriter> EvictWorker<W> {
	fn run(self) {
		debug!("Eviction server started");
		while let Some(batch) = self.queue.next_batch(self.wait) {
			trace!("Eviction server processing {} requests", batch.len());
			for request in batch {
				self.process(request);
			}
		}
		debug!("Eviction server stopped");
	}

	fn process(&self, request: EvictRequest) {
		let guard = self.serializer.lock();
		let result = self.evict_page(&guard, &request.page);
		if result.is_err() {
			self.queue.stats.failed.fetch_add(1, Ordering::Relaxed);
			request.page.cancel_scheduled_eviction();
		}

		match &request.waiter {
			Some(session) => self.serializer.complete(session, None, result),
			None => {
				if let Err(err) = result {
					warn!("Forced eviction of {} failed: {err}", request.page.id());
				}
			}
		}
	}

	fn evict_page(&self, _guard: &SerialGuard<'_>, page: &Arc<Page>) -> OpResult {
		if !page.is_live() {
			trace!("{} was already evicted", page.id());
			return Ok(());
		}
		if page.is_modified() {
			self.writer.write_page(&page.snapshot())?;
			page.clear_modified();
		}
		page.mark_evicted();
		self.cache.remove(page);
		self.queue.stats.evicted.fetch_add(1, Ordering::Relaxed);
		debug!("Evicted {}", page.id());
		Ok(())
	}
}
