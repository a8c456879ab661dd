//! The RPC packet codec.
//!
//! A packet is the unit the router operates on: a type, the three routing
//! ids, an opaque payload, and a status that is meaningful on terminal
//! packets. Fields at their default value are omitted on the wire (proto3
//! presence rules); unknown fields are skipped on decode.

use crate::encoding::{varint_len, DecodeError, FieldReader, FieldWriter};
use crate::{CallId, ChannelId, MethodId, ServiceId, Status};

/// Packet type codes. The numeric values are wire-significant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client → server: begin a call. Carries the request payload for unary
    /// and server-streaming methods.
    Request = 0,
    /// Server → client: final packet of a call, payload plus status.
    Response = 1,
    /// Client → server: one payload of a client stream.
    ClientStream = 2,
    /// Server → client: one payload of a server stream.
    ServerStream = 3,
    /// Client → server: the client terminated the call. Status only.
    ClientError = 4,
    /// Server → client: the server terminated the call. Status only.
    ServerError = 5,
    /// Client → server: no more client-stream payloads will follow.
    ClientStreamEnd = 6,
}

impl PacketType {
    fn from_wire(value: u64) -> Result<PacketType, DecodeError> {
        Ok(match value {
            0 => PacketType::Request,
            1 => PacketType::Response,
            2 => PacketType::ClientStream,
            3 => PacketType::ServerStream,
            4 => PacketType::ClientError,
            5 => PacketType::ServerError,
            6 => PacketType::ClientStreamEnd,
            other => return Err(DecodeError::UnknownPacketType(other)),
        })
    }

    /// True for the packet types that end a call for their sender.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PacketType::Response | PacketType::ClientError | PacketType::ServerError
        )
    }
}

/// In-memory representation of an RPC packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub channel_id: ChannelId,
    pub service_id: ServiceId,
    pub method_id: MethodId,
    pub payload: Vec<u8>,
    pub status: Status,
    pub call_id: CallId,
}

/// The routing triple of a packet, used below to keep constructors short.
type Route = (ChannelId, ServiceId, MethodId);

impl Packet {
    fn new(packet_type: PacketType, route: Route, payload: Vec<u8>, status: Status) -> Packet {
        let (channel_id, service_id, method_id) = route;
        Packet {
            packet_type,
            channel_id,
            service_id,
            method_id,
            payload,
            status,
            call_id: CallId::new(0),
        }
    }

    pub fn request(route: Route, payload: Vec<u8>) -> Packet {
        Packet::new(PacketType::Request, route, payload, Status::Ok)
    }

    pub fn response(route: Route, payload: Vec<u8>, status: Status) -> Packet {
        Packet::new(PacketType::Response, route, payload, status)
    }

    pub fn client_stream(route: Route, payload: Vec<u8>) -> Packet {
        Packet::new(PacketType::ClientStream, route, payload, Status::Ok)
    }

    pub fn server_stream(route: Route, payload: Vec<u8>) -> Packet {
        Packet::new(PacketType::ServerStream, route, payload, Status::Ok)
    }

    pub fn client_error(route: Route, status: Status) -> Packet {
        Packet::new(PacketType::ClientError, route, Vec::new(), status)
    }

    pub fn server_error(route: Route, status: Status) -> Packet {
        Packet::new(PacketType::ServerError, route, Vec::new(), status)
    }

    pub fn client_stream_end(route: Route) -> Packet {
        Packet::new(PacketType::ClientStreamEnd, route, Vec::new(), Status::Ok)
    }

    /// The routing triple of this packet.
    pub fn route(&self) -> Route {
        (self.channel_id, self.service_id, self.method_id)
    }

    /// The largest payload a stream or response packet can carry through an
    /// output whose buffer holds `mtu` bytes, assuming worst-case framing
    /// (packet type, all three routing ids, status, and the payload field's
    /// tag and length prefix).
    pub fn max_payload_size(mtu: usize) -> usize {
        let overhead = 2 + 3 * 5 + 2 + 1 + varint_len(mtu as u64);
        mtu.saturating_sub(overhead)
    }

    /// Number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.packet_type != PacketType::Request {
            len += 1 + varint_len(self.packet_type as u64);
        }
        if self.channel_id.raw() != 0 {
            len += 1 + 4;
        }
        if self.service_id.raw() != 0 {
            len += 1 + 4;
        }
        if self.method_id.raw() != 0 {
            len += 1 + 4;
        }
        if !self.payload.is_empty() {
            len += 1 + varint_len(self.payload.len() as u64) + self.payload.len();
        }
        if !self.status.is_ok() {
            len += 1 + varint_len(self.status.code() as u64);
        }
        if self.call_id.raw() != 0 {
            len += 1 + varint_len(self.call_id.raw() as u64);
        }
        len
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        let mut writer = FieldWriter::new(&mut out);

        if self.packet_type != PacketType::Request {
            writer.varint(1, self.packet_type as u64);
        }
        if self.channel_id.raw() != 0 {
            writer.fixed32(2, self.channel_id.raw());
        }
        if self.service_id.raw() != 0 {
            writer.fixed32(3, self.service_id.raw());
        }
        if self.method_id.raw() != 0 {
            writer.fixed32(4, self.method_id.raw());
        }
        if !self.payload.is_empty() {
            writer.bytes(5, &self.payload);
        }
        if !self.status.is_ok() {
            writer.varint(6, self.status.code() as u64);
        }
        if self.call_id.raw() != 0 {
            writer.varint(7, self.call_id.raw() as u64);
        }
        out
    }

    /// Encode into `buf`, returning the packet length, or `None` when the
    /// encoded packet does not fit.
    pub fn encode_into(&self, buf: &mut [u8]) -> Option<usize> {
        let encoded = self.encode();
        if encoded.len() > buf.len() {
            return None;
        }
        buf[..encoded.len()].copy_from_slice(&encoded);
        Some(encoded.len())
    }

    /// Decode a packet. Unknown fields are skipped; an out-of-range status
    /// code decodes as [`Status::Unknown`].
    pub fn decode(data: &[u8]) -> Result<Packet, DecodeError> {
        let mut packet = Packet::request((ChannelId::new(0), ServiceId::new(0), MethodId::new(0)), Vec::new());

        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => packet.packet_type = PacketType::from_wire(value.as_varint(field)?)?,
                2 => packet.channel_id = ChannelId::new(value.as_fixed32(field)?),
                3 => packet.service_id = ServiceId::new(value.as_fixed32(field)?),
                4 => packet.method_id = MethodId::new(value.as_fixed32(field)?),
                5 => packet.payload = value.as_bytes(field)?.to_vec(),
                6 => packet.status = Status::from_code_lossy(value.as_u32(field)?),
                7 => packet.call_id = CallId::new(value.as_u32(field)?),
                _ => {} // Unknown field: already consumed, nothing to record.
            }
        }

        Ok(packet)
    }
}
