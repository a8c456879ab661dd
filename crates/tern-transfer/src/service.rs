//! The server side of the transfer protocol.
//!
//! `TransferService` exposes one RPC service with two bidirectional
//! streaming methods, `Read` and `Write`. Chunks for any number of transfer
//! ids are multiplexed over those two streams; per-id sessions track the
//! window, the expected offset, and completion. The receiver drives flow
//! control in both directions: for reads the client sends parameters chunks
//! and the server sends data, for writes the roles flip.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tern_rpc::{MethodDescriptor, ServerReaderWriter, Service};
use tern_wire::{Chunk, Packet, Status, TransferId};

use crate::handler::{ReadHandler, WriteHandler};

/// Fully qualified name of the transfer service.
pub const SERVICE_NAME: &str = "tern.transfer.Transfer";
/// Method serving read transfers (server → client data).
pub const READ_METHOD: &str = "Read";
/// Method serving write transfers (client → server data).
pub const WRITE_METHOD: &str = "Write";

/// Server-side transfer limits.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Largest window granted to a writing client, before the destination
    /// writer's remaining capacity is applied.
    pub max_pending_bytes: u32,
    /// Upper bound on the data carried by one chunk, before the RPC
    /// channel's buffer size is applied.
    pub max_chunk_size_bytes: u32,
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig {
            max_pending_bytes: 8192,
            max_chunk_size_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Session open, moving data.
    Data,
    /// Terminal status exchanged; kept for idempotent replies.
    Completed,
}

struct ReadSession {
    phase: Phase,
    offset: u32,
    pending_bytes: u32,
    client_max_chunk_size: Option<u32>,
}

struct WriteSession {
    phase: Phase,
    offset: u32,
    pending_bytes: u32,
    max_chunk_size: u32,
    /// The terminal status this server reported, for replay when the client
    /// retries its final chunk.
    final_status: Option<Status>,
    /// One parameters retransmission per gap; reset on in-order data.
    recovery_sent: bool,
    /// Offset of the most recent data chunk, in or out of order. A repeat
    /// of exactly this chunk means the client saw no answer and needs the
    /// parameters again.
    last_offset: Option<u32>,
}

struct ServerState {
    config: TransferConfig,
    read_handlers: HashMap<TransferId, Box<dyn ReadHandler>>,
    write_handlers: HashMap<TransferId, Box<dyn WriteHandler>>,
    read_stream: Option<ServerReaderWriter>,
    write_stream: Option<ServerReaderWriter>,
    read_sessions: HashMap<TransferId, ReadSession>,
    write_sessions: HashMap<TransferId, WriteSession>,
}

/// Registry of transfer handlers plus the RPC service that serves them.
pub struct TransferService {
    state: Arc<Mutex<ServerState>>,
}

impl TransferService {
    pub fn new(config: TransferConfig) -> TransferService {
        TransferService {
            state: Arc::new(Mutex::new(ServerState {
                config,
                read_handlers: HashMap::new(),
                write_handlers: HashMap::new(),
                read_stream: None,
                write_stream: None,
                read_sessions: HashMap::new(),
                write_sessions: HashMap::new(),
            })),
        }
    }

    /// Serve read transfers for `id` from `handler`. `AlreadyExists` if the
    /// id is taken.
    pub fn register_read_handler(
        &self,
        id: TransferId,
        handler: Box<dyn ReadHandler>,
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.read_handlers.contains_key(&id) {
            return Err(Status::AlreadyExists);
        }
        state.read_handlers.insert(id, handler);
        Ok(())
    }

    /// Remove the read handler for `id`. `FailedPrecondition` while a
    /// session for it is in progress.
    pub fn unregister_read_handler(&self, id: TransferId) -> Result<(), Status> {
        let mut state = self.state.lock();
        if matches!(state.read_sessions.get(&id), Some(session) if session.phase == Phase::Data) {
            return Err(Status::FailedPrecondition);
        }
        state.read_sessions.remove(&id);
        state
            .read_handlers
            .remove(&id)
            .map(|_| ())
            .ok_or(Status::NotFound)
    }

    /// Serve write transfers for `id` into `handler`. `AlreadyExists` if
    /// the id is taken.
    pub fn register_write_handler(
        &self,
        id: TransferId,
        handler: Box<dyn WriteHandler>,
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.write_handlers.contains_key(&id) {
            return Err(Status::AlreadyExists);
        }
        state.write_handlers.insert(id, handler);
        Ok(())
    }

    /// Remove the write handler for `id`. `FailedPrecondition` while a
    /// session for it is in progress.
    pub fn unregister_write_handler(&self, id: TransferId) -> Result<(), Status> {
        let mut state = self.state.lock();
        if matches!(state.write_sessions.get(&id), Some(session) if session.phase == Phase::Data) {
            return Err(Status::FailedPrecondition);
        }
        state.write_sessions.remove(&id);
        state
            .write_handlers
            .remove(&id)
            .map(|_| ())
            .ok_or(Status::NotFound)
    }

    /// The RPC service to register with a server.
    pub fn service(&self) -> Service {
        let read_state = Arc::clone(&self.state);
        let write_state = Arc::clone(&self.state);

        Service::new(SERVICE_NAME)
            .with_method(MethodDescriptor::bidi_streaming(READ_METHOD, move |mut stream| {
                let chunk_state = Arc::clone(&read_state);
                stream.set_on_next(move |payload| {
                    if let Some(chunk) = decode_chunk(payload) {
                        chunk_state.lock().handle_read_chunk(chunk);
                    }
                });
                read_state.lock().read_stream = Some(stream);
            }))
            .with_method(MethodDescriptor::bidi_streaming(WRITE_METHOD, move |mut stream| {
                let chunk_state = Arc::clone(&write_state);
                stream.set_on_next(move |payload| {
                    if let Some(chunk) = decode_chunk(payload) {
                        chunk_state.lock().handle_write_chunk(chunk);
                    }
                });
                write_state.lock().write_stream = Some(stream);
            }))
    }
}

fn decode_chunk(payload: &[u8]) -> Option<Chunk> {
    match Chunk::decode(payload) {
        Ok(chunk) => Some(chunk),
        Err(error) => {
            tracing::warn!(%error, "dropping undecodable chunk");
            None
        }
    }
}

fn send_chunk(stream: Option<&mut ServerReaderWriter>, chunk: &Chunk) {
    let Some(stream) = stream else {
        tracing::debug!(id = %chunk.transfer_id, "no open stream for chunk");
        return;
    };
    if let Err(status) = stream.write(&chunk.encode()) {
        tracing::warn!(id = %chunk.transfer_id, %status, "chunk send failed");
    }
}

impl ServerState {
    // ------------------------------------------------------------------
    // Read transfers: client sends parameters, we send data
    // ------------------------------------------------------------------

    fn send_read_chunk(&mut self, chunk: &Chunk) {
        send_chunk(self.read_stream.as_mut(), chunk);
    }

    fn handle_read_chunk(&mut self, chunk: Chunk) {
        let id = chunk.transfer_id;

        if chunk.is_initial() {
            // A fresh opening chunk always wins: abort anything in progress
            // and start over, exactly like a first-ever start.
            if let Some(session) = self.read_sessions.remove(&id) {
                if session.phase == Phase::Data {
                    tracing::debug!(id = %id, "read restarted by client");
                    if let Some(handler) = self.read_handlers.get_mut(&id) {
                        handler.finalize_read(Status::Aborted);
                    }
                }
            }
            self.start_read_session(chunk);
            return;
        }

        let Some(phase) = self.read_sessions.get(&id).map(|s| s.phase) else {
            tracing::debug!(id = %id, "chunk for idle read transfer ignored");
            return;
        };

        match phase {
            Phase::Completed => {
                // Repeating the terminal chunk is allowed and changes
                // nothing; any other traffic is out of order.
                if !chunk.is_terminal() {
                    self.send_read_chunk(&Chunk::terminal(id, Status::FailedPrecondition));
                }
            }
            Phase::Data => {
                if let Some(status) = chunk.status {
                    if let Some(handler) = self.read_handlers.get_mut(&id) {
                        handler.finalize_read(status);
                    }
                    if let Some(session) = self.read_sessions.get_mut(&id) {
                        session.phase = Phase::Completed;
                    }
                    return;
                }
                self.apply_read_parameters(chunk);
            }
        }
    }

    fn start_read_session(&mut self, chunk: Chunk) {
        let id = chunk.transfer_id;

        let Some(handler) = self.read_handlers.get_mut(&id) else {
            tracing::debug!(id = %id, "read for unregistered transfer");
            self.send_read_chunk(&Chunk::terminal(id, Status::NotFound));
            return;
        };

        if let Err(status) = handler.prepare_read() {
            // Refused, but not fatal: the transfer stays idle and the
            // client may try again later.
            tracing::debug!(id = %id, %status, "prepare_read refused the session");
            self.send_read_chunk(&Chunk::terminal(id, Status::DataLoss));
            return;
        }

        self.read_sessions.insert(
            id,
            ReadSession {
                phase: Phase::Data,
                offset: 0,
                pending_bytes: 0,
                client_max_chunk_size: None,
            },
        );
        self.apply_read_parameters(chunk);
    }

    /// Validate a parameters chunk, seek if the client moved the offset,
    /// then serve data for the granted window.
    fn apply_read_parameters(&mut self, chunk: Chunk) {
        let id = chunk.transfer_id;

        let Some(pending) = chunk.pending_bytes else {
            self.fail_read(id, Status::InvalidArgument);
            return;
        };
        if pending == 0 {
            self.fail_read(id, Status::Internal);
            return;
        }

        let current = self.read_sessions.get(&id).map(|s| s.offset).unwrap_or(0);
        if chunk.offset != current {
            let seek = match self.read_handlers.get_mut(&id) {
                Some(handler) => handler.reader().seek(chunk.offset as u64),
                None => Err(Status::Internal),
            };
            if let Err(status) = seek {
                tracing::debug!(id = %id, offset = chunk.offset, %status, "seek refused");
                self.fail_read(id, status);
                return;
            }
        }

        if let Some(session) = self.read_sessions.get_mut(&id) {
            session.offset = chunk.offset;
            session.pending_bytes = pending;
            if chunk.max_chunk_size_bytes.is_some() {
                session.client_max_chunk_size = chunk.max_chunk_size_bytes;
            }
        }
        self.service_read_window(id);
    }

    /// Emit data chunks until the window is exhausted or the source runs
    /// out. A drained source gets a trailing `remaining_bytes = 0` marker;
    /// the session then waits for the client's terminal status.
    fn service_read_window(&mut self, id: TransferId) {
        loop {
            let Some(session) = self.read_sessions.get(&id) else { return };
            if session.phase != Phase::Data || session.pending_bytes == 0 {
                return;
            }
            let offset = session.offset;
            let pending = session.pending_bytes;
            let client_max = session.client_max_chunk_size;

            let Some(stream) = self.read_stream.as_ref() else { return };
            let Ok(payload_capacity) = stream.payload_capacity() else { return };

            let mut budget = Chunk::max_data_size(payload_capacity, id, offset);
            budget = budget.min(self.config.max_chunk_size_bytes as usize);
            if let Some(max) = client_max {
                budget = budget.min(max as usize);
            }
            budget = budget.min(pending as usize);
            if budget == 0 {
                return;
            }

            let Some(handler) = self.read_handlers.get_mut(&id) else { return };
            let mut data = vec![0u8; budget];
            match handler.reader().read(&mut data) {
                Ok(0) | Err(Status::OutOfRange) => {
                    let trailer = Chunk::data(id, offset, Vec::new()).with_remaining_bytes(0);
                    self.send_read_chunk(&trailer);
                    return;
                }
                Ok(n) => {
                    data.truncate(n);
                    self.send_read_chunk(&Chunk::data(id, offset, data));
                    let Some(session) = self.read_sessions.get_mut(&id) else { return };
                    session.offset += n as u32;
                    session.pending_bytes -= n as u32;
                }
                Err(status) => {
                    tracing::warn!(id = %id, %status, "source failed mid-transfer");
                    self.fail_read(id, Status::DataLoss);
                    return;
                }
            }
        }
    }

    fn fail_read(&mut self, id: TransferId, status: Status) {
        self.send_read_chunk(&Chunk::terminal(id, status));
        if let Some(handler) = self.read_handlers.get_mut(&id) {
            handler.finalize_read(status);
        }
        if let Some(session) = self.read_sessions.get_mut(&id) {
            session.phase = Phase::Completed;
        }
    }

    // ------------------------------------------------------------------
    // Write transfers: we send parameters, the client sends data
    // ------------------------------------------------------------------

    fn send_write_chunk(&mut self, chunk: &Chunk) {
        send_chunk(self.write_stream.as_mut(), chunk);
    }

    fn handle_write_chunk(&mut self, chunk: Chunk) {
        let id = chunk.transfer_id;

        if chunk.is_initial() {
            if let Some(session) = self.write_sessions.remove(&id) {
                if session.phase == Phase::Data {
                    tracing::debug!(id = %id, "write restarted by client");
                    if let Some(handler) = self.write_handlers.get_mut(&id) {
                        let _ = handler.finalize_write(Status::Aborted);
                    }
                }
            }
            self.start_write_session(id);
            return;
        }

        let Some(phase) = self.write_sessions.get(&id).map(|s| s.phase) else {
            tracing::debug!(id = %id, "chunk for idle write transfer ignored");
            return;
        };

        match phase {
            Phase::Completed => self.handle_completed_write_chunk(id, &chunk),
            Phase::Data => {
                if let Some(status) = chunk.status {
                    // The client ended the session from its side; data in
                    // the same chunk is moot.
                    self.finish_write_from_client(id, status);
                } else {
                    self.accept_write_data(id, &chunk);
                }
            }
        }
    }

    /// Idempotent completion: a retry of the chunk that finished the
    /// transfer is answered with the same terminal status; anything else
    /// gets `FailedPrecondition`.
    fn handle_completed_write_chunk(&mut self, id: TransferId, chunk: &Chunk) {
        let final_status = self.write_sessions.get(&id).and_then(|s| s.final_status);
        if chunk.remaining_bytes == Some(0) || chunk.is_terminal() {
            if let Some(status) = final_status {
                self.send_write_chunk(&Chunk::terminal(id, status));
            }
        } else {
            self.send_write_chunk(&Chunk::terminal(id, Status::FailedPrecondition));
        }
    }

    fn start_write_session(&mut self, id: TransferId) {
        let Some(handler) = self.write_handlers.get_mut(&id) else {
            tracing::debug!(id = %id, "write for unregistered transfer");
            self.send_write_chunk(&Chunk::terminal(id, Status::NotFound));
            return;
        };

        if let Err(status) = handler.prepare_write() {
            tracing::debug!(id = %id, %status, "prepare_write refused the session");
            self.send_write_chunk(&Chunk::terminal(id, Status::DataLoss));
            return;
        }

        let capacity = handler.writer().remaining_capacity().unwrap_or(u64::MAX);
        let window = (self.config.max_pending_bytes as u64).min(capacity) as u32;

        let payload_capacity = match self.write_stream.as_ref().map(|s| s.payload_capacity()) {
            Some(Ok(capacity)) => capacity,
            _ => return,
        };
        let max_chunk = (self.config.max_chunk_size_bytes as usize)
            .min(Chunk::max_data_size(payload_capacity, id, 0)) as u32;

        self.write_sessions.insert(
            id,
            WriteSession {
                phase: Phase::Data,
                offset: 0,
                pending_bytes: window,
                max_chunk_size: max_chunk,
                final_status: None,
                recovery_sent: false,
                last_offset: None,
            },
        );

        if window == 0 {
            self.fail_write(id, Status::ResourceExhausted);
            return;
        }
        self.send_write_chunk(&Chunk::parameters(id, 0, window).with_max_chunk_size(max_chunk));
    }

    fn accept_write_data(&mut self, id: TransferId, chunk: &Chunk) {
        let Some(session) = self.write_sessions.get_mut(&id) else { return };
        let expected = session.offset;

        if chunk.offset != expected {
            let repeated = session.last_offset == Some(chunk.offset);
            let first_gap = !session.recovery_sent;
            session.recovery_sent = true;
            session.last_offset = Some(chunk.offset);
            let params = Chunk::parameters(id, session.offset, session.pending_bytes)
                .with_max_chunk_size(session.max_chunk_size);
            if repeated || first_gap {
                tracing::debug!(id = %id, got = chunk.offset, expected, "offset gap; sending parameters");
                self.send_write_chunk(&params);
            }
            return;
        }

        if chunk.data.len() as u64 > session.pending_bytes as u64 {
            tracing::debug!(id = %id, "client overran its window");
            self.fail_write(id, Status::Internal);
            return;
        }

        let write = match self.write_handlers.get_mut(&id) {
            Some(handler) => handler.writer().write(&chunk.data),
            None => Err(Status::Internal),
        };
        if let Err(status) = write {
            tracing::warn!(id = %id, %status, "destination failed mid-transfer");
            self.fail_write(id, Status::DataLoss);
            return;
        }

        let exhausted = {
            let Some(session) = self.write_sessions.get_mut(&id) else { return };
            session.offset += chunk.data.len() as u32;
            session.pending_bytes -= chunk.data.len() as u32;
            session.recovery_sent = false;
            session.last_offset = Some(chunk.offset);
            session.pending_bytes == 0
        };

        if chunk.remaining_bytes == Some(0) {
            self.complete_write(id);
        } else if exhausted {
            self.grant_write_window(id);
        }
    }

    /// The client's closing handshake: finalize and report the result; the
    /// client waits for this terminal chunk.
    fn complete_write(&mut self, id: TransferId) {
        let reported = match self.write_handlers.get_mut(&id) {
            Some(handler) => match handler.finalize_write(Status::Ok) {
                Ok(()) => Status::Ok,
                Err(status) => {
                    tracing::warn!(id = %id, %status, "finalize_write failed");
                    Status::DataLoss
                }
            },
            None => Status::Internal,
        };
        self.send_write_chunk(&Chunk::terminal(id, reported));
        if let Some(session) = self.write_sessions.get_mut(&id) {
            session.phase = Phase::Completed;
            session.final_status = Some(reported);
        }
    }

    /// The client ended the session with an explicit status chunk. OK still
    /// finalizes as success; only a failing finalize is worth a reply, since
    /// the client is not waiting for one.
    fn finish_write_from_client(&mut self, id: TransferId, status: Status) {
        let final_status = if status.is_ok() {
            let failed = match self.write_handlers.get_mut(&id) {
                Some(handler) => handler.finalize_write(Status::Ok).is_err(),
                None => false,
            };
            if failed {
                self.send_write_chunk(&Chunk::terminal(id, Status::DataLoss));
                Some(Status::DataLoss)
            } else {
                Some(Status::Ok)
            }
        } else {
            if let Some(handler) = self.write_handlers.get_mut(&id) {
                let _ = handler.finalize_write(status);
            }
            None
        };

        if let Some(session) = self.write_sessions.get_mut(&id) {
            session.phase = Phase::Completed;
            session.final_status = final_status;
        }
    }

    fn fail_write(&mut self, id: TransferId, status: Status) {
        self.send_write_chunk(&Chunk::terminal(id, status));
        if let Some(handler) = self.write_handlers.get_mut(&id) {
            let _ = handler.finalize_write(status);
        }
        if let Some(session) = self.write_sessions.get_mut(&id) {
            session.phase = Phase::Completed;
            session.final_status = Some(status);
        }
    }

    /// The window is spent with source data still to come: grant another,
    /// bounded by whatever room the destination has left.
    fn grant_write_window(&mut self, id: TransferId) {
        let capacity = match self.write_handlers.get_mut(&id) {
            Some(handler) => handler.writer().remaining_capacity().unwrap_or(u64::MAX),
            None => return,
        };
        let window = (self.config.max_pending_bytes as u64).min(capacity) as u32;
        if window == 0 {
            self.fail_write(id, Status::ResourceExhausted);
            return;
        }

        let Some(session) = self.write_sessions.get_mut(&id) else { return };
        session.pending_bytes = window;
        session.recovery_sent = false;
        let params = Chunk::parameters(id, session.offset, window)
            .with_max_chunk_size(session.max_chunk_size);
        self.send_write_chunk(&params);
    }
}

/// Largest data payload a chunk can carry on a stream whose channel MTU is
/// `mtu`, at `offset` within the transfer. Exposed so tests and senders can
/// agree with the service's chunking arithmetic.
pub fn max_chunk_data_for_mtu(mtu: usize, id: TransferId, offset: u32) -> usize {
    Chunk::max_data_size(Packet::max_payload_size(mtu), id, offset)
}
