// Lint config
#![cfg_attr(
	not(test),
	warn(clippy::cast_possible_wrap),
	warn(clippy::cast_possible_truncation)
)]

mod cache;
mod connection;
mod consts;
mod evict;
pub mod ops;
mod page;
mod serial;
mod session;
mod sync;
mod utils;

pub use cache::PageCacheConfig;
pub use connection::{Connection, ConnectionConfig, ConnectionError, SessionHandle};
pub use evict::{DiscardWriter, EvictApi, EvictConfig, EvictHandle, EvictRequest, EvictStats, EvictWriter};
pub use page::{Page, PageId, PageSnapshot, PageState};
pub use serial::{Critical, SerialOp, Serializer};
pub use session::{OpError, OpResult, Session, SessionId, SessionState, WqState};
pub use sync::{LockStats, SerialConfig, SerialGuard};
