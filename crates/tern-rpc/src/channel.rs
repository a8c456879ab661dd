//! Channels and their packet sinks.
//!
//! A channel is an addressable transport endpoint: an id paired with an
//! output that hands out a payload buffer, sends it, and reports its MTU.
//! The core acquires the buffer, encodes one packet into it, and either
//! sends or releases it; that acquire/release window is the only sequence a
//! [`ChannelOutput`] has to support, and the sink's lock makes it exclusive.

use std::sync::Arc;

use parking_lot::Mutex;
use tern_wire::{Packet, Status};

/// A packet sink bound to one channel.
///
/// `acquire_payload_buffer` / `send_and_release_buffer` (or
/// `release_buffer`) are always called as a pair, never nested; an
/// implementation may assert on a second acquire. The buffer's length is the
/// channel's MTU.
pub trait ChannelOutput: Send {
    /// Exclusive access to the output buffer for assembling one packet.
    fn acquire_payload_buffer(&mut self) -> &mut [u8];

    /// Transmit the first `packet_len` bytes of the acquired buffer and
    /// release it.
    fn send_and_release_buffer(&mut self, packet_len: usize) -> Result<(), Status>;

    /// Release the acquired buffer without sending anything.
    fn release_buffer(&mut self);

    /// Size of the acquirable buffer.
    fn maximum_transmission_unit(&self) -> usize;
}

/// Cheap clonable handle to a [`ChannelOutput`].
///
/// The server binds one of these per channel; every packet emitted on the
/// channel goes through it. Cloning shares the underlying output.
#[derive(Clone)]
pub struct ChannelSink {
    output: Arc<Mutex<Box<dyn ChannelOutput>>>,
}

impl ChannelSink {
    pub fn new(output: impl ChannelOutput + 'static) -> ChannelSink {
        ChannelSink {
            output: Arc::new(Mutex::new(Box::new(output))),
        }
    }

    /// The MTU of the underlying output.
    pub fn mtu(&self) -> usize {
        self.output.lock().maximum_transmission_unit()
    }

    /// Encode `packet` into the acquired buffer and send it.
    ///
    /// Returns `Internal` when the encoded packet does not fit the buffer;
    /// nothing is sent in that case.
    pub(crate) fn send_packet(&self, packet: &Packet) -> Result<(), Status> {
        let mut output = self.output.lock();
        let packet_len = match packet.encode_into(output.acquire_payload_buffer()) {
            Some(len) => len,
            None => {
                output.release_buffer();
                tracing::debug!(
                    needed = packet.encoded_len(),
                    mtu = output.maximum_transmission_unit(),
                    "packet does not fit output buffer"
                );
                return Err(Status::Internal);
            }
        };
        output.send_and_release_buffer(packet_len)
    }
}

impl std::fmt::Debug for ChannelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::VectorOutput;
    use tern_wire::{ChannelId, MethodId, ServiceId};

    fn route() -> (ChannelId, ServiceId, MethodId) {
        (ChannelId::new(1), ServiceId::new(2), MethodId::new(3))
    }

    #[test]
    fn send_packet_encodes_into_the_output() {
        let output = VectorOutput::new(64);
        let log = output.log();
        let sink = ChannelSink::new(output);

        let packet = Packet::response(route(), vec![1, 2, 3], Status::Ok);
        sink.send_packet(&packet).unwrap();

        assert_eq!(log.packets(), vec![packet]);
    }

    #[test]
    fn oversized_packet_is_rejected_without_sending() {
        let output = VectorOutput::new(16);
        let log = output.log();
        let sink = ChannelSink::new(output);

        let packet = Packet::response(route(), vec![0; 32], Status::Ok);
        assert_eq!(sink.send_packet(&packet), Err(Status::Internal));
        assert!(log.packets().is_empty());
    }
}
