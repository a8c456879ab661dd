//! The client side of the transfer protocol.
//!
//! One `Client` multiplexes any number of transfer sessions over two shared
//! bidirectional RPC streams (one for reads, one for writes), opened lazily
//! on first use. Inbound chunks are handed to the work queue so the thread
//! delivering RPC packets never blocks on stream I/O; completion callbacks
//! run outside the client's lock, so they may start new transfers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tern_rpc::{ChannelId, ClientReaderWriter, MethodId, ServiceId};
use tern_wire::{Chunk, Status, TransferId};

use crate::service::{READ_METHOD, SERVICE_NAME, WRITE_METHOD};
use crate::stream::{Reader, Writer};
use crate::timer::RetryTimer;
use crate::work_queue::{InlineWorkQueue, WorkQueue};

/// Retransmission policy for unacknowledged chunks.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// How long to wait for the peer before re-sending the most recent
    /// parameters or data chunk.
    pub chunk_timeout: std::time::Duration,
    /// Expirations tolerated per session before it completes with
    /// `DeadlineExceeded`.
    pub max_retries: u32,
}

/// Client-side transfer limits and collaborators policy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Window requested from the server on reads, before the destination
    /// writer's remaining capacity is applied.
    pub max_bytes_to_receive: u32,
    /// Upper bound on the data carried by one outbound chunk, before the
    /// server's advertisement and the RPC channel's buffer are applied.
    pub max_chunk_size_bytes: u32,
    /// Retransmission policy; `None` disables the retry timer.
    pub retry: Option<RetryPolicy>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_bytes_to_receive: 8192,
            max_chunk_size_bytes: 1024,
            retry: None,
        }
    }
}

type CompletionFn = Box<dyn FnOnce(Status) + Send>;
type Completion = (CompletionFn, Status);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// The byte stream a session moves data through.
enum Endpoint {
    /// Read transfer: received data lands here.
    Receive(Box<dyn Writer>),
    /// Write transfer: outbound data comes from here.
    Send(Box<dyn Reader>),
}

/// What to do after a session digested a chunk; the caller owns the streams
/// and the completion list, so actions are returned rather than performed.
enum Action {
    Nothing,
    /// Send these chunks and re-arm the retry timer.
    Send(Vec<Chunk>),
    /// Send a terminal chunk with this status, then complete the session
    /// with it.
    Terminate(Status),
}

struct Session {
    id: TransferId,
    io: Endpoint,
    offset: u32,
    /// Read side: bytes still expected in the current window.
    pending_bytes: u32,
    /// Read side: a gap was signalled; discard out-of-order chunks until
    /// the sender resynchronizes.
    recovering: bool,
    /// Offset of the most recent data chunk, accepted or not. A repeat of
    /// exactly that chunk while recovering re-triggers the parameters.
    last_received_offset: Option<u32>,
    on_completion: Option<CompletionFn>,
    /// Most recent flow chunk, re-sent by the retry timer.
    last_chunk: Option<Chunk>,
    retries: u32,
}

impl Session {
    fn direction(&self) -> Direction {
        match self.io {
            Endpoint::Receive(_) => Direction::Read,
            Endpoint::Send(_) => Direction::Write,
        }
    }

    /// Digest a data chunk of a read transfer.
    fn apply_read_data(&mut self, chunk: &Chunk, max_window: u32) -> Action {
        let Endpoint::Receive(sink) = &mut self.io else {
            return Action::Terminate(Status::Internal);
        };

        if chunk.offset != self.offset {
            let repeated = self.last_received_offset == Some(chunk.offset);
            let first_gap = !self.recovering;
            self.recovering = true;
            self.last_received_offset = Some(chunk.offset);
            if repeated || first_gap {
                let params = Chunk::parameters(self.id, self.offset, self.pending_bytes);
                self.last_chunk = Some(params.clone());
                return Action::Send(vec![params]);
            }
            return Action::Nothing;
        }

        if chunk.data.len() as u64 > self.pending_bytes as u64 {
            tracing::debug!(id = %self.id, "sender overran the window");
            return Action::Terminate(Status::Internal);
        }
        if sink.write(&chunk.data).is_err() {
            return Action::Terminate(Status::Internal);
        }

        self.offset += chunk.data.len() as u32;
        self.pending_bytes -= chunk.data.len() as u32;
        self.recovering = false;
        self.last_received_offset = Some(chunk.offset);
        self.retries = 0;

        if chunk.remaining_bytes == Some(0) {
            return Action::Terminate(Status::Ok);
        }

        if self.pending_bytes == 0 {
            let capacity = sink.remaining_capacity().unwrap_or(u64::MAX);
            let window = (max_window as u64).min(capacity) as u32;
            if window == 0 {
                return Action::Terminate(Status::ResourceExhausted);
            }
            self.pending_bytes = window;
            let params = Chunk::parameters(self.id, self.offset, window);
            self.last_chunk = Some(params.clone());
            return Action::Send(vec![params]);
        }

        Action::Nothing
    }

    /// Digest a parameters chunk of a write transfer: seek if asked, then
    /// emit data chunks for the granted window.
    fn apply_write_parameters(
        &mut self,
        chunk: &Chunk,
        payload_capacity: usize,
        max_chunk_config: u32,
    ) -> Action {
        let Some(pending) = chunk.pending_bytes else {
            return Action::Terminate(Status::InvalidArgument);
        };
        if pending == 0 {
            return Action::Terminate(Status::Internal);
        }

        let Endpoint::Send(source) = &mut self.io else {
            return Action::Terminate(Status::Internal);
        };

        if chunk.offset != self.offset {
            if !source.supports_seek() {
                return Action::Terminate(Status::Unimplemented);
            }
            if let Err(status) = source.seek(chunk.offset as u64) {
                return Action::Terminate(status);
            }
            self.offset = chunk.offset;
        }

        let mut window = pending;
        let mut chunks = Vec::new();
        while window > 0 {
            let budget = Chunk::max_data_size(payload_capacity, self.id, self.offset)
                .min(max_chunk_config as usize)
                .min(chunk.max_chunk_size_bytes.map_or(usize::MAX, |m| m as usize))
                .min(window as usize);
            if budget == 0 {
                break;
            }
            let mut data = vec![0u8; budget];
            match source.read(&mut data) {
                Ok(0) | Err(Status::OutOfRange) => {
                    chunks.push(Chunk::data(self.id, self.offset, Vec::new()).with_remaining_bytes(0));
                    break;
                }
                Ok(n) => {
                    data.truncate(n);
                    chunks.push(Chunk::data(self.id, self.offset, data));
                    self.offset += n as u32;
                    window -= n as u32;
                }
                Err(status) => {
                    tracing::warn!(id = %self.id, %status, "source failed mid-transfer");
                    return Action::Terminate(Status::DataLoss);
                }
            }
        }

        self.last_chunk = chunks.last().cloned();
        self.retries = 0;
        Action::Send(chunks)
    }
}

struct ClientState {
    rpc: Arc<tern_rpc::Client>,
    channel_id: ChannelId,
    config: ClientConfig,
    work_queue: Arc<dyn WorkQueue>,
    timer: Option<Arc<dyn RetryTimer>>,
    timer_epoch: u64,
    weak: Weak<Mutex<ClientState>>,
    read_stream: Option<ClientReaderWriter>,
    write_stream: Option<ClientReaderWriter>,
    sessions: HashMap<TransferId, Session>,
}

/// Starts and runs transfer sessions against a remote transfer service.
pub struct Client {
    state: Arc<Mutex<ClientState>>,
}

impl Client {
    /// A client with inline chunk processing and no retry timer. Only for
    /// transports that deliver packets asynchronously; see
    /// [`InlineWorkQueue`].
    pub fn new(rpc: Arc<tern_rpc::Client>, channel_id: ChannelId, config: ClientConfig) -> Client {
        Client::with_collaborators(rpc, channel_id, config, Arc::new(InlineWorkQueue), None)
    }

    pub fn with_collaborators(
        rpc: Arc<tern_rpc::Client>,
        channel_id: ChannelId,
        config: ClientConfig,
        work_queue: Arc<dyn WorkQueue>,
        timer: Option<Arc<dyn RetryTimer>>,
    ) -> Client {
        let state = Arc::new(Mutex::new(ClientState {
            rpc,
            channel_id,
            config,
            work_queue,
            timer,
            timer_epoch: 0,
            weak: Weak::new(),
            read_stream: None,
            write_stream: None,
            sessions: HashMap::new(),
        }));
        state.lock().weak = Arc::downgrade(&state);
        Client { state }
    }

    /// Fetch the transfer `id` from the server into `sink`. `on_completion`
    /// fires exactly once with the overall status.
    pub fn read(
        &self,
        id: TransferId,
        sink: Box<dyn Writer>,
        on_completion: impl FnOnce(Status) + Send + 'static,
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(&id) {
            return Err(Status::FailedPrecondition);
        }
        state.ensure_stream(Direction::Read)?;

        let capacity = sink.remaining_capacity().unwrap_or(u64::MAX);
        let window = (state.config.max_bytes_to_receive as u64).min(capacity) as u32;
        if window == 0 {
            return Err(Status::ResourceExhausted);
        }

        let params = Chunk::parameters(id, 0, window);
        state.sessions.insert(
            id,
            Session {
                id,
                io: Endpoint::Receive(sink),
                offset: 0,
                pending_bytes: window,
                recovering: false,
                last_received_offset: None,
                on_completion: Some(Box::new(on_completion)),
                last_chunk: Some(params.clone()),
                retries: 0,
            },
        );
        tracing::debug!(id = %id, window, "starting read transfer");
        state.send(Direction::Read, &params);
        state.arm_retry();
        Ok(())
    }

    /// Push `source` to the server as transfer `id`. `on_completion` fires
    /// exactly once with the overall status.
    pub fn write(
        &self,
        id: TransferId,
        source: Box<dyn Reader>,
        on_completion: impl FnOnce(Status) + Send + 'static,
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(&id) {
            return Err(Status::FailedPrecondition);
        }
        state.ensure_stream(Direction::Write)?;

        let opener = Chunk::bare(id);
        state.sessions.insert(
            id,
            Session {
                id,
                io: Endpoint::Send(source),
                offset: 0,
                pending_bytes: 0,
                recovering: false,
                last_received_offset: None,
                on_completion: Some(Box::new(on_completion)),
                last_chunk: Some(opener.clone()),
                retries: 0,
            },
        );
        tracing::debug!(id = %id, "starting write transfer");
        state.send(Direction::Write, &opener);
        state.arm_retry();
        Ok(())
    }

    fn process_chunk(state: &Arc<Mutex<ClientState>>, direction: Direction, payload: &[u8]) {
        let chunk = match Chunk::decode(payload) {
            Ok(chunk) => chunk,
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable chunk");
                return;
            }
        };

        let mut completions = Vec::new();
        state.lock().handle_chunk(direction, chunk, &mut completions);
        run_completions(completions);
    }

    fn fail_stream(state: &Arc<Mutex<ClientState>>, direction: Direction, status: Status) {
        let mut completions = Vec::new();
        {
            let mut state = state.lock();
            tracing::warn!(?direction, %status, "transfer stream failed");
            match direction {
                Direction::Read => state.read_stream = None,
                Direction::Write => state.write_stream = None,
            }
            let ids: Vec<TransferId> = state
                .sessions
                .values()
                .filter(|session| session.direction() == direction)
                .map(|session| session.id)
                .collect();
            for id in ids {
                complete_session(&mut state.sessions, id, status, &mut completions);
            }
            state.arm_retry();
        }
        run_completions(completions);
    }

    fn handle_retry_timeout(state: &Arc<Mutex<ClientState>>, epoch: u64) {
        let mut completions = Vec::new();
        {
            let mut state = state.lock();
            if state.timer_epoch != epoch {
                return; // Stale firing after a cancel or re-arm.
            }
            let Some(policy) = state.config.retry else { return };

            let ids: Vec<TransferId> = state.sessions.keys().copied().collect();
            for id in ids {
                let expired = {
                    let Some(session) = state.sessions.get_mut(&id) else {
                        continue;
                    };
                    session.retries += 1;
                    session.retries > policy.max_retries
                };
                if expired {
                    tracing::warn!(id = %id, "transfer timed out");
                    complete_session(&mut state.sessions, id, Status::DeadlineExceeded, &mut completions);
                    continue;
                }
                let resend = state
                    .sessions
                    .get(&id)
                    .and_then(|session| session.last_chunk.clone());
                let direction = match state.sessions.get(&id) {
                    Some(session) => session.direction(),
                    None => continue,
                };
                if let Some(chunk) = resend {
                    tracing::debug!(id = %id, "re-sending last chunk after timeout");
                    state.send(direction, &chunk);
                }
            }
            state.arm_retry();
        }
        run_completions(completions);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("sessions", &self.state.lock().sessions.len())
            .finish_non_exhaustive()
    }
}

fn run_completions(completions: Vec<Completion>) {
    for (callback, status) in completions {
        callback(status);
    }
}

fn complete_session(
    sessions: &mut HashMap<TransferId, Session>,
    id: TransferId,
    status: Status,
    completions: &mut Vec<Completion>,
) {
    if let Some(mut session) = sessions.remove(&id) {
        if let Some(callback) = session.on_completion.take() {
            completions.push((callback, status));
        }
    }
}

impl ClientState {
    /// Open the shared RPC stream for `direction` if it is not open yet.
    fn ensure_stream(&mut self, direction: Direction) -> Result<(), Status> {
        let slot = match direction {
            Direction::Read => &self.read_stream,
            Direction::Write => &self.write_stream,
        };
        if slot.is_some() {
            return Ok(());
        }

        let method = match direction {
            Direction::Read => READ_METHOD,
            Direction::Write => WRITE_METHOD,
        };
        let mut stream = self.rpc.invoke_bidirectional(
            self.channel_id,
            ServiceId::of(SERVICE_NAME),
            MethodId::of(method),
        )?;

        let weak = self.weak.clone();
        let queue = Arc::clone(&self.work_queue);
        stream.set_on_next(move |payload| {
            let payload = payload.to_vec();
            let weak = weak.clone();
            queue.schedule(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    Client::process_chunk(&state, direction, &payload);
                }
            }));
        });

        let weak = self.weak.clone();
        let queue = Arc::clone(&self.work_queue);
        stream.set_on_error(move |status| {
            let weak = weak.clone();
            queue.schedule(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    Client::fail_stream(&state, direction, status);
                }
            }));
        });

        match direction {
            Direction::Read => self.read_stream = Some(stream),
            Direction::Write => self.write_stream = Some(stream),
        }
        Ok(())
    }

    fn send(&mut self, direction: Direction, chunk: &Chunk) {
        let stream = match direction {
            Direction::Read => self.read_stream.as_mut(),
            Direction::Write => self.write_stream.as_mut(),
        };
        let Some(stream) = stream else {
            tracing::debug!(id = %chunk.transfer_id, "no open stream for chunk");
            return;
        };
        if let Err(status) = stream.write(&chunk.encode()) {
            tracing::warn!(id = %chunk.transfer_id, %status, "chunk send failed");
        }
    }

    fn handle_chunk(&mut self, direction: Direction, chunk: Chunk, completions: &mut Vec<Completion>) {
        let id = chunk.transfer_id;

        let Some(session) = self.sessions.get_mut(&id) else {
            tracing::trace!(id = %id, "chunk for inactive transfer");
            return;
        };
        if session.direction() != direction {
            tracing::warn!(id = %id, ?direction, "chunk arrived on the wrong stream");
            complete_session(&mut self.sessions, id, Status::Internal, completions);
            self.arm_retry();
            return;
        }

        // A terminal chunk from the server ends the session, no reply.
        if let Some(status) = chunk.status {
            complete_session(&mut self.sessions, id, status, completions);
            self.arm_retry();
            return;
        }

        let action = match direction {
            Direction::Read => {
                let max_window = self.config.max_bytes_to_receive;
                match self.sessions.get_mut(&id) {
                    Some(session) => session.apply_read_data(&chunk, max_window),
                    None => return,
                }
            }
            Direction::Write => {
                let payload_capacity = match self.write_stream.as_ref().map(|s| s.payload_capacity()) {
                    Some(Ok(capacity)) => capacity,
                    _ => return,
                };
                let max_chunk = self.config.max_chunk_size_bytes;
                match self.sessions.get_mut(&id) {
                    Some(session) => session.apply_write_parameters(&chunk, payload_capacity, max_chunk),
                    None => return,
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Send(chunks) => {
                for chunk in &chunks {
                    self.send(direction, chunk);
                }
                self.arm_retry();
            }
            Action::Terminate(status) => {
                self.send(direction, &Chunk::terminal(id, status));
                complete_session(&mut self.sessions, id, status, completions);
                self.arm_retry();
            }
        }
    }

    /// (Re)arm the shared one-shot timer, or cancel it once nothing is in
    /// flight. Every arm bumps the epoch, which is how stale firings of the
    /// one-shot are told apart from the armed one.
    fn arm_retry(&mut self) {
        let Some(policy) = self.config.retry else { return };
        let Some(timer) = self.timer.clone() else { return };

        self.timer_epoch += 1;
        if self.sessions.is_empty() {
            timer.cancel();
            return;
        }

        let epoch = self.timer_epoch;
        let weak = self.weak.clone();
        timer.invoke_at(
            Instant::now() + policy.chunk_timeout,
            Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    Client::handle_retry_timeout(&state, epoch);
                }
            }),
        );
    }
}
