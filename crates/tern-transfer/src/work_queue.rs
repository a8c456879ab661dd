//! Deferred execution for the transfer client.
//!
//! Inbound chunks arrive on whatever thread drives the RPC client; handing
//! them to a work queue keeps that thread from blocking on stream I/O and
//! breaks the send→receive cycle when both endpoints live in one process.

use std::collections::VecDeque;

use parking_lot::Mutex;

pub type Work = Box<dyn FnOnce() + Send>;

/// Where the transfer client defers its chunk processing.
pub trait WorkQueue: Send + Sync {
    fn schedule(&self, work: Work);
}

/// Runs work immediately on the scheduling thread.
///
/// Only suitable when the transport delivers packets asynchronously: with a
/// loopback transport that calls straight back into the endpoint, inline
/// execution re-enters the client while it is still sending and deadlocks.
/// Use [`FifoWorkQueue`] (or a real executor) there.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorkQueue;

impl WorkQueue for InlineWorkQueue {
    fn schedule(&self, work: Work) {
        work();
    }
}

/// Collects work and runs it when asked, in submission order.
#[derive(Default)]
pub struct FifoWorkQueue {
    queue: Mutex<VecDeque<Work>>,
}

impl FifoWorkQueue {
    pub fn new() -> FifoWorkQueue {
        FifoWorkQueue::default()
    }

    /// Run queued work, including work scheduled while draining, until the
    /// queue is empty.
    pub fn run_until_idle(&self) {
        loop {
            let work = self.queue.lock().pop_front();
            match work {
                Some(work) => work(),
                None => return,
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl WorkQueue for FifoWorkQueue {
    fn schedule(&self, work: Work) {
        self.queue.lock().push_back(work);
    }
}
