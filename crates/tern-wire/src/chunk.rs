//! The transfer chunk codec.
//!
//! Chunks are the unit of the reliable transfer protocol and ride inside the
//! payload of stream packets. A chunk with `status` set is terminal for its
//! sender; a chunk with `pending_bytes` set and no data carries flow-control
//! parameters from the receiver to the sender.

use crate::encoding::{varint_len, DecodeError, FieldReader, FieldWriter};
use crate::{Status, TransferId};

/// One transfer protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chunk {
    pub transfer_id: TransferId,
    /// Bytes the receiver is willing to accept starting at `offset`.
    pub pending_bytes: Option<u32>,
    /// Largest data chunk the sender may emit.
    pub max_chunk_size_bytes: Option<u32>,
    /// Advisory pacing hint; carried but not acted on by this implementation.
    pub min_delay_microseconds: Option<u32>,
    /// Byte position this chunk refers to. `pending_bytes` windows are
    /// interpreted relative to this offset.
    pub offset: u32,
    pub data: Vec<u8>,
    /// Bytes left in the source after this chunk; 0 marks the sender's last
    /// data chunk.
    pub remaining_bytes: Option<u64>,
    /// Terminal status. The session is over for the sender once this is set.
    pub status: Option<Status>,
}

impl Chunk {
    /// The bare opening chunk of a write transfer: id only.
    pub fn bare(transfer_id: TransferId) -> Chunk {
        Chunk {
            transfer_id,
            ..Chunk::default()
        }
    }

    /// A flow-control parameters chunk.
    pub fn parameters(transfer_id: TransferId, offset: u32, pending_bytes: u32) -> Chunk {
        Chunk {
            transfer_id,
            offset,
            pending_bytes: Some(pending_bytes),
            ..Chunk::default()
        }
    }

    /// A data chunk.
    pub fn data(transfer_id: TransferId, offset: u32, data: Vec<u8>) -> Chunk {
        Chunk {
            transfer_id,
            offset,
            data,
            ..Chunk::default()
        }
    }

    /// A terminal status chunk.
    pub fn terminal(transfer_id: TransferId, status: Status) -> Chunk {
        Chunk {
            transfer_id,
            status: Some(status),
            ..Chunk::default()
        }
    }

    pub fn with_max_chunk_size(mut self, max: u32) -> Chunk {
        self.max_chunk_size_bytes = Some(max);
        self
    }

    pub fn with_remaining_bytes(mut self, remaining: u64) -> Chunk {
        self.remaining_bytes = Some(remaining);
        self
    }

    /// True for chunks that open a session: offset zero and none of the
    /// data, status, or end-of-data fields. (`remaining_bytes` matters for
    /// zero-length sources, whose final marker also sits at offset 0.)
    pub fn is_initial(&self) -> bool {
        self.offset == 0
            && self.data.is_empty()
            && self.status.is_none()
            && self.remaining_bytes.is_none()
    }

    /// True once `status` is set; the sender is done with the session.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }

    /// How many data bytes fit in a chunk when the encoded chunk must stay
    /// within `available` bytes. Accounts for worst-case framing of the id,
    /// an offset anywhere inside the window, a `remaining_bytes = 0` marker,
    /// and the data field's own tag and length prefix.
    pub fn max_data_size(available: usize, transfer_id: TransferId, offset: u32) -> usize {
        let worst_offset = offset as u64 + available as u64;
        let overhead = 1
            + varint_len(transfer_id.raw() as u64)
            + 1
            + varint_len(worst_offset)
            + 1
            + 1
            + 1
            + varint_len(available as u64);
        available.saturating_sub(overhead)
    }

    /// Encode into a fresh buffer.
    ///
    /// `transfer_id` is always written so that no chunk encodes to zero
    /// bytes. `pending_bytes` and `status` are written whenever present,
    /// including explicit zeros: a zero window and an OK terminal status are
    /// both meaningful on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = FieldWriter::new(&mut out);

        writer.varint(1, self.transfer_id.raw() as u64);
        if let Some(pending) = self.pending_bytes {
            writer.varint(2, pending as u64);
        }
        if let Some(max) = self.max_chunk_size_bytes {
            writer.varint(3, max as u64);
        }
        if let Some(delay) = self.min_delay_microseconds {
            writer.varint(4, delay as u64);
        }
        if self.offset != 0 {
            writer.varint(5, self.offset as u64);
        }
        if !self.data.is_empty() {
            writer.bytes(6, &self.data);
        }
        if let Some(remaining) = self.remaining_bytes {
            writer.varint(7, remaining);
        }
        if let Some(status) = self.status {
            writer.varint(8, status.code() as u64);
        }
        out
    }

    /// Decode a chunk. Unknown fields are skipped.
    pub fn decode(data: &[u8]) -> Result<Chunk, DecodeError> {
        let mut chunk = Chunk::default();

        let mut reader = FieldReader::new(data);
        while let Some((field, value)) = reader.next_field()? {
            match field {
                1 => chunk.transfer_id = TransferId::new(value.as_u32(field)?),
                2 => chunk.pending_bytes = Some(value.as_u32(field)?),
                3 => chunk.max_chunk_size_bytes = Some(value.as_u32(field)?),
                4 => chunk.min_delay_microseconds = Some(value.as_u32(field)?),
                5 => chunk.offset = value.as_u32(field)?,
                6 => chunk.data = value.as_bytes(field)?.to_vec(),
                7 => chunk.remaining_bytes = Some(value.as_varint(field)?),
                8 => chunk.status = Some(Status::from_code_lossy(value.as_u32(field)?)),
                _ => {}
            }
        }

        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: TransferId = TransferId::new(3);

    #[test]
    fn encode_decode_round_trip() {
        let chunks = [
            Chunk::bare(ID),
            Chunk::parameters(ID, 0, 64),
            Chunk::parameters(ID, 16, 48).with_max_chunk_size(8),
            Chunk::data(ID, 32, vec![0xaa; 16]),
            Chunk::data(ID, 0, vec![1]).with_remaining_bytes(0),
            Chunk::terminal(ID, Status::Ok),
            Chunk::terminal(ID, Status::Internal),
        ];

        for chunk in chunks {
            assert_eq!(Chunk::decode(&chunk.encode()).unwrap(), chunk);
        }
    }

    #[test]
    fn explicit_zeros_survive_the_wire() {
        let zero_window = Chunk::parameters(ID, 0, 0);
        let decoded = Chunk::decode(&zero_window.encode()).unwrap();
        assert_eq!(decoded.pending_bytes, Some(0));

        let ok_terminal = Chunk::terminal(ID, Status::Ok);
        let decoded = Chunk::decode(&ok_terminal.encode()).unwrap();
        assert_eq!(decoded.status, Some(Status::Ok));
    }

    #[test]
    fn initial_and_terminal_predicates() {
        assert!(Chunk::bare(ID).is_initial());
        assert!(Chunk::parameters(ID, 0, 64).is_initial());
        assert!(!Chunk::parameters(ID, 8, 64).is_initial());
        assert!(!Chunk::data(ID, 0, vec![1]).is_initial());
        assert!(!Chunk::terminal(ID, Status::Ok).is_initial());
        assert!(Chunk::terminal(ID, Status::Ok).is_terminal());

        // The final marker of a zero-length source is not an opener.
        assert!(!Chunk::data(ID, 0, Vec::new()).with_remaining_bytes(0).is_initial());
    }

    #[test]
    fn max_data_size_fits_the_budget() {
        for available in [32usize, 64, 128, 1024] {
            for offset in [0u32, 8, 100_000] {
                let size = Chunk::max_data_size(available, ID, offset);
                assert!(size < available);

                // A chunk of exactly that size, at the worst offset in the
                // window, must encode within the budget.
                let chunk = Chunk::data(ID, offset + available as u32, vec![0xff; size])
                    .with_remaining_bytes(0);
                assert!(chunk.encode().len() <= available);
            }
        }
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut encoded = Chunk::data(ID, 4, vec![7, 8]).encode();
        // Append an unknown varint field (number 15).
        encoded.extend_from_slice(&[0x78, 0x2a]);
        let decoded = Chunk::decode(&encoded).unwrap();
        assert_eq!(decoded.data, vec![7, 8]);
        assert_eq!(decoded.offset, 4);
    }
}
