#![deny(unsafe_code)]

//! The tern RPC core: packet routing, method dispatch, and call tracking.
//!
//! A [`Server`] demultiplexes inbound packets to registered [`Service`]s and
//! owns the server side of every active call; a [`Client`] issues calls and
//! routes responses, stream payloads, and errors back to their callbacks.
//! Payloads are raw bytes end to end; serialization is the caller's concern.
//!
//! Both endpoints share one locking rule: bookkeeping happens under a single
//! per-endpoint lock, and user callbacks always run with that lock released,
//! so handlers and callbacks may reenter the endpoint freely.

mod call;
mod channel;
mod client;
mod method;
mod server;
mod service;
pub mod testing;

pub use channel::{ChannelOutput, ChannelSink};
pub use client::{Client, ClientReader, ClientReaderWriter, ClientWriter, UnaryCall};
pub use method::{MethodDescriptor, MethodKind};
pub use server::{Server, ServerConfig, ServerReader, ServerReaderWriter, ServerWriter, UnaryResponder};
pub use service::Service;

pub use tern_wire::{CallId, ChannelId, MethodId, Packet, PacketType, ServiceId, Status};
