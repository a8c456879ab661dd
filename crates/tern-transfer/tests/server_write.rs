//! Server-side write transfers: the server grants windows, the client sends
//! data.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tern_rpc::testing::{PacketLog, VectorOutput};
use tern_rpc::{ChannelId, ChannelSink, MethodId, Packet, PacketType, Server, ServerConfig, ServiceId};
use tern_transfer::{
    max_chunk_data_for_mtu, Chunk, MemoryWriter, Status, TransferConfig, TransferId,
    TransferService, WriteHandler, Writer, SERVICE_NAME,
};

const CHANNEL: ChannelId = ChannelId::new(1);
const MTU: usize = 256;
const ID: TransferId = TransferId::new(7);

fn test_data(n: usize) -> Vec<u8> {
    (0..n).map(|i| i as u8).collect()
}

// ---------------------------------------------------------------------------
// Test infrastructure
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WriteStats {
    prepared: AtomicUsize,
    finalized: Mutex<Vec<Status>>,
    received: Mutex<Vec<u8>>,
}

impl WriteStats {
    fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    fn finalized(&self) -> Vec<Status> {
        self.finalized.lock().clone()
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }
}

/// Writes into a capacity-bounded buffer mirrored into the stats.
struct BufferWriteHandler {
    stats: Arc<WriteStats>,
    writer: SharedWriter,
    capacity: usize,
    finalize_result: Result<(), Status>,
}

struct SharedWriter {
    inner: MemoryWriter,
    stats: Arc<WriteStats>,
}

impl Writer for SharedWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        self.inner.write(data)?;
        self.stats.received.lock().extend_from_slice(data);
        Ok(())
    }

    fn remaining_capacity(&self) -> Option<u64> {
        self.inner.remaining_capacity()
    }
}

impl BufferWriteHandler {
    fn new(capacity: usize, stats: Arc<WriteStats>) -> Box<BufferWriteHandler> {
        Box::new(BufferWriteHandler {
            writer: SharedWriter {
                inner: MemoryWriter::new(capacity),
                stats: Arc::clone(&stats),
            },
            capacity,
            stats,
            finalize_result: Ok(()),
        })
    }

    fn failing_finalize(capacity: usize, stats: Arc<WriteStats>) -> Box<BufferWriteHandler> {
        let mut handler = BufferWriteHandler::new(capacity, stats);
        handler.finalize_result = Err(Status::FailedPrecondition);
        handler
    }
}

impl WriteHandler for BufferWriteHandler {
    fn prepare_write(&mut self) -> Result<(), Status> {
        self.stats.prepared.fetch_add(1, Ordering::SeqCst);
        // Every session starts with an empty destination.
        self.writer.inner = MemoryWriter::new(self.capacity);
        self.stats.received.lock().clear();
        Ok(())
    }

    fn finalize_write(&mut self, status: Status) -> Result<(), Status> {
        self.stats.finalized.lock().push(status);
        self.finalize_result
    }

    fn writer(&mut self) -> &mut dyn Writer {
        &mut self.writer
    }
}

struct Fixture {
    server: Server,
    sink: ChannelSink,
    log: PacketLog,
    service: TransferService,
}

impl Fixture {
    fn new(config: TransferConfig) -> Fixture {
        let output = VectorOutput::new(MTU);
        let log = output.log();
        let sink = ChannelSink::new(output);
        let server = Server::new(ServerConfig::default());

        let service = TransferService::new(config);
        server.register_service(service.service());

        let fixture = Fixture {
            server,
            sink,
            log,
            service,
        };
        let request = Packet::request(fixture.route(), Vec::new()).encode();
        fixture.server.process_packet(&request, &fixture.sink).unwrap();
        fixture
    }

    fn route(&self) -> (ChannelId, ServiceId, MethodId) {
        (CHANNEL, ServiceId::of(SERVICE_NAME), MethodId::of("Write"))
    }

    fn send(&self, chunk: &Chunk) {
        let packet = Packet::client_stream(self.route(), chunk.encode()).encode();
        self.server.process_packet(&packet, &self.sink).unwrap();
    }

    fn responses(&self) -> Vec<Chunk> {
        self.log
            .packets()
            .iter()
            .filter(|packet| packet.packet_type == PacketType::ServerStream)
            .map(|packet| Chunk::decode(&packet.payload).expect("server chunk must decode"))
            .collect()
    }
}

fn fixture_with_capacity(
    config: TransferConfig,
    capacity: usize,
) -> (Fixture, Arc<WriteStats>) {
    let fixture = Fixture::new(config);
    let stats = Arc::new(WriteStats::default());
    fixture
        .service
        .register_write_handler(ID, BufferWriteHandler::new(capacity, Arc::clone(&stats)))
        .unwrap();
    (fixture, stats)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn opening_grants_a_window() {
    let (fixture, stats) = fixture_with_capacity(
        TransferConfig {
            max_pending_bytes: 64,
            ..TransferConfig::default()
        },
        32,
    );

    fixture.send(&Chunk::bare(ID));

    assert_eq!(stats.prepared(), 1);
    let responses = fixture.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].offset, 0);
    // Window bounded by the destination, chunk size by the channel buffer.
    assert_eq!(responses[0].pending_bytes, Some(32));
    let expected_max = (TransferConfig::default().max_chunk_size_bytes as usize)
        .min(max_chunk_data_for_mtu(MTU, ID, 0)) as u32;
    assert_eq!(responses[0].max_chunk_size_bytes, Some(expected_max));
}

#[test]
fn single_chunk_write_completes() {
    let (fixture, stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, test_data(32)).with_remaining_bytes(0));

    let responses = fixture.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].status, Some(Status::Ok));

    assert_eq!(stats.finalized(), vec![Status::Ok]);
    assert_eq!(stats.received(), test_data(32));
}

#[test]
fn failing_finalize_reports_data_loss() {
    let fixture = Fixture::new(TransferConfig::default());
    let stats = Arc::new(WriteStats::default());
    fixture
        .service
        .register_write_handler(
            ID,
            BufferWriteHandler::failing_finalize(32, Arc::clone(&stats)),
        )
        .unwrap();

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, test_data(32)).with_remaining_bytes(0));

    let responses = fixture.responses();
    assert_eq!(responses.last().unwrap().status, Some(Status::DataLoss));
    // finalize itself saw a successful transfer.
    assert_eq!(stats.finalized(), vec![Status::Ok]);
}

#[test]
fn window_exhaustion_grants_the_next_window() {
    let (fixture, stats) = fixture_with_capacity(
        TransferConfig {
            max_pending_bytes: 16,
            ..TransferConfig::default()
        },
        32,
    );

    fixture.send(&Chunk::bare(ID));
    let responses = fixture.responses();
    assert_eq!(responses[0].pending_bytes, Some(16));

    fixture.send(&Chunk::data(ID, 0, test_data(32)[..8].to_vec()));
    assert_eq!(fixture.responses().len(), 1);

    fixture.send(&Chunk::data(ID, 8, test_data(32)[8..16].to_vec()));
    let responses = fixture.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].offset, 16);
    assert_eq!(responses[1].pending_bytes, Some(16));

    fixture.send(&Chunk::data(ID, 16, test_data(32)[16..24].to_vec()));
    assert_eq!(fixture.responses().len(), 2);

    fixture.send(&Chunk::data(ID, 24, test_data(32)[24..].to_vec()).with_remaining_bytes(0));
    let responses = fixture.responses();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[2].status, Some(Status::Ok));

    assert_eq!(stats.finalized(), vec![Status::Ok]);
    assert_eq!(stats.received(), test_data(32));
}

#[test]
fn window_is_bounded_by_the_destination() {
    let (fixture, _stats) = fixture_with_capacity(TransferConfig::default(), 8);

    fixture.send(&Chunk::bare(ID));
    assert_eq!(fixture.responses()[0].pending_bytes, Some(8));
}

#[test]
fn unexpected_offset_resends_parameters_without_advancing() {
    let (fixture, stats) = fixture_with_capacity(
        TransferConfig {
            max_pending_bytes: 32,
            ..TransferConfig::default()
        },
        32,
    );

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, test_data(32)[..16].to_vec()));
    assert_eq!(fixture.responses().len(), 1);

    // Wrong offset: the window parameters come back at the current offset.
    fixture.send(&Chunk::data(ID, 8, test_data(32)[16..].to_vec()).with_remaining_bytes(0));
    let responses = fixture.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].offset, 16);
    assert_eq!(responses[1].pending_bytes, Some(16));

    // The corrected chunk completes the transfer.
    fixture.send(&Chunk::data(ID, 16, test_data(32)[16..].to_vec()).with_remaining_bytes(0));
    let responses = fixture.responses();
    assert_eq!(responses.last().unwrap().status, Some(Status::Ok));
    assert_eq!(stats.finalized(), vec![Status::Ok]);
    assert_eq!(stats.received(), test_data(32));
}

#[test]
fn window_overrun_is_internal() {
    let (fixture, stats) = fixture_with_capacity(
        TransferConfig {
            max_pending_bytes: 16,
            ..TransferConfig::default()
        },
        64,
    );

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, test_data(64)[..8].to_vec()));
    fixture.send(&Chunk::data(ID, 8, test_data(64)[8..12].to_vec()));

    // pending is now 4; sending 8 overruns the window.
    fixture.send(&Chunk::data(ID, 12, test_data(64)[12..20].to_vec()));

    let responses = fixture.responses();
    assert_eq!(responses.last().unwrap().status, Some(Status::Internal));
    assert_eq!(stats.finalized(), vec![Status::Internal]);
}

#[test]
fn unregistered_transfer_is_not_found() {
    let (fixture, _stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk::bare(TransferId::new(999)));

    let responses = fixture.responses();
    assert_eq!(responses[0].transfer_id, TransferId::new(999));
    assert_eq!(responses[0].status, Some(Status::NotFound));
}

#[test]
fn client_abort_finalizes_without_a_reply() {
    let (fixture, stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk::bare(ID));
    assert_eq!(fixture.responses().len(), 1);

    fixture.send(&Chunk::terminal(ID, Status::DataLoss));
    assert_eq!(fixture.responses().len(), 1);
    assert_eq!(stats.finalized(), vec![Status::DataLoss]);
}

#[test]
fn one_parameters_update_per_gap() {
    let (fixture, stats) = fixture_with_capacity(
        TransferConfig {
            max_pending_bytes: 32,
            ..TransferConfig::default()
        },
        32,
    );
    let data = test_data(32);

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, data[..1].to_vec()));

    // Drop offset 1, then spray the rest one byte at a time.
    for offset in 2..32u32 {
        fixture.send(&Chunk::data(ID, offset, data[offset as usize..offset as usize + 1].to_vec()));
    }

    // Exactly one recovery parameters chunk, at the gap.
    let responses = fixture.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].offset, 1);
    assert_eq!(responses[1].pending_bytes, Some(31));

    // Resending from the gap finishes the transfer; the final chunk may
    // carry the client's terminal status directly.
    fixture.send(&Chunk {
        transfer_id: ID,
        offset: 1,
        data: data[1..].to_vec(),
        status: Some(Status::Ok),
        ..Chunk::default()
    });
    assert_eq!(stats.finalized(), vec![Status::Ok]);
}

#[test]
fn repeated_chunk_during_recovery_resends_parameters() {
    let (fixture, stats) = fixture_with_capacity(
        TransferConfig {
            max_pending_bytes: 32,
            ..TransferConfig::default()
        },
        32,
    );
    let data = test_data(32);

    fixture.send(&Chunk::bare(ID));

    // Skip offset 0 entirely.
    for offset in 1..32u32 {
        fixture.send(&Chunk::data(ID, offset, data[offset as usize..offset as usize + 1].to_vec()));
    }
    assert_eq!(fixture.responses().len(), 2); // initial grant + one recovery

    // A repeat of the last chunk means the client is waiting: parameters
    // again, each time.
    let last = Chunk::data(ID, 31, data[31..].to_vec());
    fixture.send(&last);
    assert_eq!(fixture.responses().len(), 3);
    fixture.send(&last);
    assert_eq!(fixture.responses().len(), 4);

    let resent = &fixture.responses()[3];
    assert_eq!(resent.offset, 0);
    assert_eq!(resent.pending_bytes, Some(32));

    // Normal operation resumes at the correct offset.
    fixture.send(&Chunk {
        transfer_id: ID,
        offset: 0,
        data: data.clone(),
        status: Some(Status::Ok),
        ..Chunk::default()
    });
    assert_eq!(stats.finalized(), vec![Status::Ok]);
}

#[test]
fn retried_final_chunk_gets_the_same_status_again() {
    let (fixture, stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk::bare(ID));
    let last = Chunk::data(ID, 0, test_data(32)).with_remaining_bytes(0);
    fixture.send(&last);

    let responses = fixture.responses();
    assert_eq!(responses.last().unwrap().status, Some(Status::Ok));
    let baseline = responses.len();

    // The client did not see the status and retries its final chunk.
    fixture.send(&last);
    let responses = fixture.responses();
    assert_eq!(responses.len(), baseline + 1);
    assert_eq!(responses.last().unwrap().status, Some(Status::Ok));

    // finalize_write ran once.
    assert_eq!(stats.finalized(), vec![Status::Ok]);
}

#[test]
fn non_final_chunks_after_completion_are_failed_precondition() {
    let (fixture, _stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, test_data(32)).with_remaining_bytes(0));

    fixture.send(&Chunk::data(ID, 0, test_data(32)));
    let responses = fixture.responses();
    assert_eq!(responses.last().unwrap().status, Some(Status::FailedPrecondition));
}

#[test]
fn non_initial_chunks_without_a_session_are_ignored() {
    let (fixture, stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk {
        transfer_id: ID,
        offset: 3,
        ..Chunk::default()
    });
    fixture.send(&Chunk::data(ID, 0, test_data(10)));
    fixture.send(&Chunk::terminal(ID, Status::Ok));

    assert_eq!(stats.prepared(), 0);
    assert!(stats.finalized().is_empty());
    assert!(fixture.responses().is_empty());
}

#[test]
fn repeated_initial_chunk_aborts_and_restarts() {
    let (fixture, stats) = fixture_with_capacity(TransferConfig::default(), 32);

    fixture.send(&Chunk::bare(ID));
    fixture.send(&Chunk::data(ID, 0, test_data(32)[..16].to_vec()));
    assert_eq!(fixture.responses().len(), 1);
    assert_eq!(stats.prepared(), 1);

    // The client disappears and starts over.
    fixture.send(&Chunk::bare(ID));
    assert_eq!(stats.prepared(), 2);
    assert_eq!(stats.finalized(), vec![Status::Aborted]);
    assert_eq!(fixture.responses().len(), 2);

    fixture.send(&Chunk::data(ID, 0, test_data(32)).with_remaining_bytes(0));
    assert_eq!(fixture.responses().last().unwrap().status, Some(Status::Ok));
    assert_eq!(stats.finalized(), vec![Status::Aborted, Status::Ok]);
}
