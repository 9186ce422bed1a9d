//! Recycling of per-request contexts.
//!
//! Each request borrows a [`Context`] from the pool and hands it back when the
//! chain returns, so the allocations behind params and the key/value bag are
//! reused across requests. The pool is a bounded lock-free queue; when it is
//! full the returned context is simply dropped.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::context::Context;
use crate::options::Options;
use crate::response::ResponseWriter;

pub(crate) struct ContextPool {
    idle: ArrayQueue<Box<Context>>,
    options: Arc<Options>,
}

impl ContextPool {
    pub(crate) fn new(options: Arc<Options>) -> Self {
        Self { idle: ArrayQueue::new(options.pool_capacity), options }
    }

    /// An idle context, or a freshly allocated one. The caller attaches the
    /// request and resets it before use.
    pub(crate) fn acquire(&self) -> Box<Context> {
        self.idle
            .pop()
            .unwrap_or_else(|| Box::new(Context::new(Arc::clone(&self.options))))
    }

    /// Takes the response out of `ctx` and returns the context to the pool.
    pub(crate) fn release(&self, mut ctx: Box<Context>) -> ResponseWriter {
        let writer = ctx.detach();
        // Full: let it drop.
        let _ = self.idle.push(ctx);
        writer
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.idle.len()
    }
}
