#![deny(unsafe_code)]

//! Wire-level types for tern.
//!
//! Everything in this crate is part of the on-wire contract: the canonical
//! status codes, the 32-bit endpoint ids and the name hash that produces
//! them, the RPC packet codec, and the transfer chunk codec layered inside
//! packet payloads. Both codecs use protobuf wire encoding (varint, fixed32,
//! length-delimited) so that foreign implementations can interoperate with a
//! stock protobuf runtime.

mod chunk;
mod encoding;
mod ids;
mod packet;
mod status;

pub use chunk::Chunk;
pub use encoding::DecodeError;
pub use ids::{hash_name, CallId, ChannelId, MethodId, ServiceId, TransferId};
pub use packet::{Packet, PacketType};
pub use status::Status;
