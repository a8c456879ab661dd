#![deny(unsafe_code)]

//! Reliable bulk transfer over tern RPC streams.
//!
//! The transfer protocol moves arbitrarily large byte streams over the RPC
//! core's bidirectional streaming primitive, identified by an
//! application-chosen transfer id. The receiver drives flow control in both
//! directions by granting windows (`pending_bytes` from a given offset);
//! gaps are repaired by re-sending the window parameters, and sessions end
//! with an explicit terminal status chunk.
//!
//! Servers register [`ReadHandler`]s and [`WriteHandler`]s with a
//! [`TransferService`]; clients drive sessions through [`Client::read`] and
//! [`Client::write`].

mod client;
mod handler;
mod service;
mod stream;
mod timer;
mod work_queue;

pub use client::{Client, ClientConfig, RetryPolicy};
pub use handler::{ReadHandler, WriteHandler};
pub use service::{
    max_chunk_data_for_mtu, TransferConfig, TransferService, READ_METHOD, SERVICE_NAME,
    WRITE_METHOD,
};
pub use stream::{MemoryReader, MemoryWriter, Reader, Writer};
pub use timer::{RetryTimer, TimerCallback};
pub use work_queue::{FifoWorkQueue, InlineWorkQueue, Work, WorkQueue};

pub use tern_wire::{Chunk, Status, TransferId};
