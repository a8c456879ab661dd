//! In-memory test plumbing shared by the workspace's protocol tests.
//!
//! [`VectorOutput`] is a [`ChannelOutput`] backed by a fixed-size buffer
//! that records every packet it is asked to send. Tests hold on to its
//! [`PacketLog`] and assert on the decoded packets after driving an
//! endpoint.

use std::sync::Arc;

use parking_lot::Mutex;
use tern_wire::Packet;

use crate::channel::ChannelOutput;
use tern_wire::Status;

/// Shared view of everything a [`VectorOutput`] has sent.
#[derive(Clone, Default)]
pub struct PacketLog {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PacketLog {
    /// Raw encoded packets, oldest first.
    pub fn raw(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// All sent packets, decoded.
    pub fn packets(&self) -> Vec<Packet> {
        self.raw()
            .iter()
            .map(|bytes| Packet::decode(bytes).expect("sent packet must decode"))
            .collect()
    }

    /// The `index`th sent packet, decoded.
    pub fn packet(&self, index: usize) -> Packet {
        let raw = self.raw();
        Packet::decode(&raw[index]).expect("sent packet must decode")
    }

    pub fn last(&self) -> Option<Packet> {
        self.packets().pop()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

/// A [`ChannelOutput`] with an MTU-sized buffer that appends every sent
/// packet to a [`PacketLog`].
pub struct VectorOutput {
    buffer: Vec<u8>,
    acquired: bool,
    log: PacketLog,
}

impl VectorOutput {
    pub fn new(mtu: usize) -> VectorOutput {
        VectorOutput {
            buffer: vec![0; mtu],
            acquired: false,
            log: PacketLog::default(),
        }
    }

    /// A log handle; clone it out before moving the output into a sink.
    pub fn log(&self) -> PacketLog {
        self.log.clone()
    }
}

impl ChannelOutput for VectorOutput {
    fn acquire_payload_buffer(&mut self) -> &mut [u8] {
        assert!(!self.acquired, "payload buffer acquired twice");
        self.acquired = true;
        &mut self.buffer
    }

    fn send_and_release_buffer(&mut self, packet_len: usize) -> Result<(), Status> {
        assert!(self.acquired, "send without acquire");
        self.acquired = false;
        self.log.sent.lock().push(self.buffer[..packet_len].to_vec());
        Ok(())
    }

    fn release_buffer(&mut self) {
        assert!(self.acquired, "release without acquire");
        self.acquired = false;
    }

    fn maximum_transmission_unit(&self) -> usize {
        self.buffer.len()
    }
}
