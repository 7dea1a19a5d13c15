use std::sync::Arc;

use crate::{
	evict::{EvictApi, EvictRequest},
	page::Page,
	serial::Critical,
	session::{OpError, OpResult},
};

/// Payload of [`update_page`].
#[derive(Debug)]
pub struct UpdateArgs {
	pub page: Arc<Page>,
	pub slot: usize,
	pub value: u64,

	/// The page's write generation when the caller read it.
	pub write_gen: u64,
}

/// Writes one slot of a page if the page is unchanged since the caller read
/// it. Completes with [`OpError::Restart`] otherwise.
pub fn update_page<E: EvictApi>(ctx: &Critical<'_, E>) {
	let args: UpdateArgs = ctx.take_args();
	let result = apply_update(ctx, &args);
	ctx.complete(Some(&args.page), result);
}

fn apply_update<E: EvictApi>(ctx: &Critical<'_, E>, args: &UpdateArgs) -> OpResult {
	if !args.page.is_live() || args.page.write_generation() != args.write_gen {
		return Err(OpError::Restart);
	}
	args.page.write_slot(ctx.guard(), args.slot, args.value)
}

/// Marks the page passed as payload modified.
pub fn mark_dirty<E: EvictApi>(ctx: &Critical<'_, E>) {
	let page: Arc<Page> = ctx.take_args();
	if page.is_live() {
		ctx.complete(Some(&page), Ok(()));
	} else {
		ctx.complete(None, Err(OpError::Restart));
	}
}

/// Hands the page passed as payload to the eviction server, which completes
/// the operation once the page is evicted. Meant to run as a
/// [`SerialOp::Evict`](crate::SerialOp::Evict) call.
pub fn request_eviction<E: EvictApi>(ctx: &Critical<'_, E>) {
	let page: Arc<Page> = ctx.take_args();
	if !page.is_live() {
		ctx.complete(None, Ok(()));
		return;
	}
	let waiter = Arc::clone(ctx.session());
	ctx.evict().schedule(EvictRequest::for_session(page, waiter));
}
