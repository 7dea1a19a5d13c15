use std::time::Duration;

use crate::utils::units::{KIB, MIB};

/// Number of value slots in a freshly created page.
pub(crate) const DEFAULT_PAGE_SLOTS: usize = 64;

/// In-memory footprint of an empty page.
pub(crate) const PAGE_BASE_SIZE: usize = 4 * KIB;

/// Footprint added to a page for every update applied to it.
pub(crate) const UPDATE_SIZE: usize = 64;

/// Pages growing beyond this footprint get a forced eviction scheduled.
pub(crate) const DEFAULT_PAGE_MAX_SIZE: usize = 5 * MIB;

/// The longest the execution lock may be held before it is reported as slow.
pub(crate) const DEFAULT_MAX_HOLD: Duration = Duration::from_millis(10);

/// Number of busy-wait iterations before a contended acquire yields the thread.
pub(crate) const DEFAULT_SPIN_LIMIT: u32 = 1000;

/// How long the eviction server sleeps when nobody wakes it.
pub(crate) const DEFAULT_SERVER_WAIT: Duration = Duration::from_secs(1);
