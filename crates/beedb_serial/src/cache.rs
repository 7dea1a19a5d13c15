use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use static_assertions::assert_impl_all;

use crate::{
	consts::DEFAULT_PAGE_SLOTS,
	page::{Page, PageId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCacheConfig {
	/// Number of value slots in every page body.
	pub page_slots: usize,
}

impl Default for PageCacheConfig {
	fn default() -> Self {
		Self {
			page_slots: DEFAULT_PAGE_SLOTS,
		}
	}
}

/// The pages currently in memory. Evicted pages are dropped from the cache and
/// recreated on the next access.
pub(crate) struct PageCache {
	pages: RwLock<HashMap<PageId, Arc<Page>>>,
	page_slots: usize,
}
assert_impl_all!(PageCache: Send, Sync);

impl PageCache {
	pub fn new(config: &PageCacheConfig) -> Self {
		Self {
			pages: RwLock::new(HashMap::new()),
			page_slots: config.page_slots,
		}
	}

	pub fn get(&self, id: PageId) -> Option<Arc<Page>> {
		self.pages.read().get(&id).cloned()
	}

	pub fn get_or_insert(&self, id: PageId) -> Arc<Page> {
		if let Some(page) = self.get(id) {
			return page;
		}
		let mut pages = self.pages.write();
		Arc::clone(
			pages
				.entry(id)
				.or_insert_with(|| Arc::new(Page::new(id, self.page_slots))),
		)
	}

	/// Removes `page` from the cache, unless the cache already holds a newer
	/// page with the same id.
	pub fn remove(&self, page: &Arc<Page>) -> bool {
		let mut pages = self.pages.write();
		match pages.get(&page.id()) {
			Some(cached) if Arc::ptr_eq(cached, page) => {
				pages.remove(&page.id());
				true
			}
			_ => false,
		}
	}

	pub fn len(&self) -> usize {
		self.pages.read().len()
	}
}
