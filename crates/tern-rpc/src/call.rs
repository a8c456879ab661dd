//! Shared endpoint state: the channel table and the active call registry.
//!
//! Both `Server` and `Client` are built on an [`EndpointCore`]: one mutex
//! guarding the channel table and the list of active calls. A call is keyed
//! by its `(channel, service, method)` route; at most one active call exists
//! per key on each endpoint. Each registered call also carries a generation
//! token so that a stale handle (moved-from, finished, or replaced) can be
//! told apart from a live one with the same key.
//!
//! User callbacks never run under the endpoint lock. The callback is taken
//! out of its slot while locked, invoked unlocked, and put back only if the
//! same call generation is still registered. A callback is therefore free to
//! finish, cancel, or restart its own call reentrantly.

use std::sync::Arc;

use parking_lot::Mutex;
use tern_wire::{ChannelId, MethodId, Packet, PacketType, ServiceId, Status};

use crate::channel::ChannelSink;
use crate::method::MethodKind;

pub(crate) type PayloadCallback = Box<dyn FnMut(&[u8]) + Send>;
pub(crate) type StatusCallback = Box<dyn FnMut(Status) + Send>;
pub(crate) type CompletionCallback = Box<dyn FnMut(&[u8], Status) + Send>;
pub(crate) type StreamEndCallback = Box<dyn FnMut() + Send>;

/// The routing triple identifying a call on one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CallKey {
    pub channel_id: ChannelId,
    pub service_id: ServiceId,
    pub method_id: MethodId,
}

impl CallKey {
    pub(crate) fn route(self) -> (ChannelId, ServiceId, MethodId) {
        (self.channel_id, self.service_id, self.method_id)
    }
}

impl From<(ChannelId, ServiceId, MethodId)> for CallKey {
    fn from((channel_id, service_id, method_id): (ChannelId, ServiceId, MethodId)) -> CallKey {
        CallKey {
            channel_id,
            service_id,
            method_id,
        }
    }
}

/// Distinguishes a live call from a stale handle with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallToken(u64);

/// The callback set of one call. Which slots are populated depends on the
/// side and kind of the call.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_next: Option<PayloadCallback>,
    pub on_error: Option<StatusCallback>,
    pub on_completed: Option<CompletionCallback>,
    pub on_client_stream_end: Option<StreamEndCallback>,
}

pub(crate) struct CallEntry {
    key: CallKey,
    token: CallToken,
    #[allow(dead_code)]
    kind: MethodKind,
    pub client_stream_open: bool,
    pub callbacks: Callbacks,
}

#[derive(Default)]
struct EndpointState {
    channels: Vec<(ChannelId, ChannelSink)>,
    calls: Vec<CallEntry>,
    next_token: u64,
}

impl EndpointState {
    fn find(&mut self, key: CallKey) -> Option<&mut CallEntry> {
        self.calls.iter_mut().find(|entry| entry.key == key)
    }

    fn find_generation(&mut self, key: CallKey, token: CallToken) -> Option<&mut CallEntry> {
        self.calls
            .iter_mut()
            .find(|entry| entry.key == key && entry.token == token)
    }

    fn remove(&mut self, key: CallKey) -> Option<CallEntry> {
        let index = self.calls.iter().position(|entry| entry.key == key)?;
        Some(self.calls.swap_remove(index))
    }

    fn remove_generation(&mut self, key: CallKey, token: CallToken) -> Option<CallEntry> {
        let index = self
            .calls
            .iter()
            .position(|entry| entry.key == key && entry.token == token)?;
        Some(self.calls.swap_remove(index))
    }

    fn channel(&self, id: ChannelId) -> Option<&ChannelSink> {
        self.channels
            .iter()
            .find(|(channel_id, _)| *channel_id == id)
            .map(|(_, sink)| sink)
    }
}

/// Shared state of one endpoint (a server or a client).
#[derive(Default)]
pub(crate) struct EndpointCore {
    state: Mutex<EndpointState>,
}

impl EndpointCore {
    // ------------------------------------------------------------------
    // Channel table
    // ------------------------------------------------------------------

    /// Bind `sink` to `id`. Returns false if the id is already bound.
    pub(crate) fn bind_channel(&self, id: ChannelId, sink: ChannelSink) -> bool {
        let mut state = self.state.lock();
        if state.channel(id).is_some() {
            return false;
        }
        state.channels.push((id, sink));
        true
    }

    pub(crate) fn channel_sink(&self, id: ChannelId) -> Option<ChannelSink> {
        self.state.lock().channel(id).cloned()
    }

    // ------------------------------------------------------------------
    // Call registry
    // ------------------------------------------------------------------

    /// Register a call for `key`, replacing any active call with the same
    /// key. The replaced call is dropped silently: its callbacks never fire
    /// again and no packet is emitted, as if the peer restarted the call.
    pub(crate) fn register_call(
        &self,
        key: CallKey,
        kind: MethodKind,
        callbacks: Callbacks,
    ) -> CallToken {
        let mut state = self.state.lock();
        if let Some(replaced) = state.remove(key) {
            tracing::debug!(
                channel = %key.channel_id,
                service = %key.service_id,
                method = %key.method_id,
                "replacing active call"
            );
            drop(replaced);
        }
        let token = CallToken(state.next_token);
        state.next_token += 1;
        state.calls.push(CallEntry {
            key,
            token,
            kind,
            client_stream_open: kind.has_client_stream(),
            callbacks,
        });
        token
    }

    /// Remove the call for `key` regardless of generation.
    pub(crate) fn abort_call(&self, key: CallKey) -> bool {
        self.state.lock().remove(key).is_some()
    }

    fn unregister(&self, key: CallKey, token: CallToken) -> Option<CallEntry> {
        self.state.lock().remove_generation(key, token)
    }

    pub(crate) fn call_exists(&self, key: CallKey) -> bool {
        self.state.lock().find(key).is_some()
    }

    /// True when a call for `key` is active and its client stream has not
    /// been half-closed.
    pub(crate) fn call_accepts_client_stream(&self, key: CallKey) -> bool {
        self.state
            .lock()
            .find(key)
            .map(|entry| entry.client_stream_open)
            .unwrap_or(false)
    }

    /// Apply `update` to the call's entry if that generation is still live.
    pub(crate) fn update_call(
        &self,
        key: CallKey,
        token: CallToken,
        update: impl FnOnce(&mut CallEntry),
    ) -> Result<(), Status> {
        let mut state = self.state.lock();
        match state.find_generation(key, token) {
            Some(entry) => {
                update(entry);
                Ok(())
            }
            None => Err(Status::FailedPrecondition),
        }
    }

    // ------------------------------------------------------------------
    // Callback dispatch (lock released around user code)
    // ------------------------------------------------------------------

    /// Deliver a stream payload to the call's `on_next`. Returns false when
    /// no call is registered for `key`.
    pub(crate) fn deliver_payload(&self, key: CallKey, payload: &[u8]) -> bool {
        let (token, callback) = {
            let mut state = self.state.lock();
            match state.find(key) {
                Some(entry) => (entry.token, entry.callbacks.on_next.take()),
                None => return false,
            }
        };

        if let Some(mut callback) = callback {
            callback(payload);
            self.restore(key, token, |slots| {
                slots.on_next.get_or_insert(callback);
            });
        }
        true
    }

    /// Deliver end-of-client-stream to the call. Returns false when no call
    /// is registered.
    pub(crate) fn deliver_client_stream_end(&self, key: CallKey) -> bool {
        let (token, callback) = {
            let mut state = self.state.lock();
            match state.find(key) {
                Some(entry) => {
                    entry.client_stream_open = false;
                    (entry.token, entry.callbacks.on_client_stream_end.take())
                }
                None => return false,
            }
        };

        if let Some(mut callback) = callback {
            callback();
            self.restore(key, token, |slots| {
                slots.on_client_stream_end.get_or_insert(callback);
            });
        }
        true
    }

    /// Complete the call: remove it and fire `on_completed`. Returns false
    /// when no call is registered (duplicate terminal packet).
    pub(crate) fn complete_call(&self, key: CallKey, payload: &[u8], status: Status) -> bool {
        let entry = {
            let mut state = self.state.lock();
            state.remove(key)
        };
        match entry {
            Some(mut entry) => {
                if let Some(callback) = entry.callbacks.on_completed.as_mut() {
                    callback(payload, status);
                }
                true
            }
            None => false,
        }
    }

    /// Terminate the call with an error: remove it and fire `on_error`.
    /// Returns false when no call is registered.
    pub(crate) fn fail_call(&self, key: CallKey, status: Status) -> bool {
        let entry = {
            let mut state = self.state.lock();
            state.remove(key)
        };
        match entry {
            Some(mut entry) => {
                if let Some(callback) = entry.callbacks.on_error.as_mut() {
                    callback(status);
                }
                true
            }
            None => false,
        }
    }

    fn restore(&self, key: CallKey, token: CallToken, put_back: impl FnOnce(&mut Callbacks)) {
        let mut state = self.state.lock();
        if let Some(entry) = state.find_generation(key, token) {
            put_back(&mut entry.callbacks);
        }
    }
}

/// Which stream packet type a call's side emits for payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallSide {
    Server,
    Client,
}

/// The live half of every streaming handle: a reference to one registered
/// call generation on an endpoint. Dropping it unregisters the call without
/// sending anything or firing callbacks; that is also what happens to the
/// source of a move and to a handle overwritten by assignment.
pub(crate) struct CallRef {
    core: Arc<EndpointCore>,
    key: CallKey,
    token: CallToken,
    side: CallSide,
}

impl CallRef {
    pub(crate) fn new(core: Arc<EndpointCore>, key: CallKey, token: CallToken, side: CallSide) -> CallRef {
        CallRef {
            core,
            key,
            token,
            side,
        }
    }

    pub(crate) fn key(&self) -> CallKey {
        self.key
    }

    /// True while this generation is still registered.
    pub(crate) fn active(&self) -> bool {
        self.core
            .state
            .lock()
            .find_generation(self.key, self.token)
            .is_some()
    }

    /// The sink of this call's channel, if the call is still active.
    fn active_sink(&self) -> Result<ChannelSink, Status> {
        let state = &mut *self.core.state.lock();
        if state
            .calls
            .iter()
            .all(|entry| entry.key != self.key || entry.token != self.token)
        {
            return Err(Status::FailedPrecondition);
        }
        state
            .channel(self.key.channel_id)
            .cloned()
            .ok_or(Status::Internal)
    }

    /// Number of payload bytes a stream packet on this call can carry.
    pub(crate) fn payload_capacity(&self) -> Result<usize, Status> {
        let sink = self.active_sink()?;
        Ok(Packet::max_payload_size(sink.mtu()))
    }

    /// Send one stream payload (SERVER_STREAM or CLIENT_STREAM depending on
    /// side). `FailedPrecondition` if the call is no longer active, or if a
    /// client-side stream was already half-closed; `Internal` if the payload
    /// does not fit the channel buffer.
    pub(crate) fn write(&self, payload: &[u8]) -> Result<(), Status> {
        let sink = {
            let state = &mut *self.core.state.lock();
            let stream_open = state
                .find_generation(self.key, self.token)
                .ok_or(Status::FailedPrecondition)?
                .client_stream_open;
            if self.side == CallSide::Client && !stream_open {
                return Err(Status::FailedPrecondition);
            }
            state
                .channel(self.key.channel_id)
                .cloned()
                .ok_or(Status::Internal)?
        };
        let packet = match self.side {
            CallSide::Server => Packet::server_stream(self.key.route(), payload.to_vec()),
            CallSide::Client => Packet::client_stream(self.key.route(), payload.to_vec()),
        };
        sink.send_packet(&packet)
    }

    /// Close the call and send its final packet. The call is unregistered
    /// even if the send fails.
    pub(crate) fn close_and_send(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        status: Status,
    ) -> Result<(), Status> {
        let sink = {
            let state = &mut *self.core.state.lock();
            if state.remove_generation(self.key, self.token).is_none() {
                return Err(Status::FailedPrecondition);
            }
            state
                .channel(self.key.channel_id)
                .cloned()
                .ok_or(Status::Internal)?
        };

        let route = self.key.route();
        let packet = match packet_type {
            PacketType::Response => Packet::response(route, payload.to_vec(), status),
            PacketType::ClientError => Packet::client_error(route, status),
            PacketType::ServerError => Packet::server_error(route, status),
            PacketType::ClientStreamEnd => Packet::client_stream_end(route),
            _ => return Err(Status::Internal),
        };
        sink.send_packet(&packet)
    }

    /// Send CLIENT_STREAM_END without closing the call (client side only).
    pub(crate) fn end_client_stream(&self) -> Result<(), Status> {
        let sink = {
            let state = &mut *self.core.state.lock();
            let entry = state
                .find_generation(self.key, self.token)
                .ok_or(Status::FailedPrecondition)?;
            if !entry.client_stream_open {
                return Err(Status::FailedPrecondition);
            }
            entry.client_stream_open = false;
            state
                .channel(self.key.channel_id)
                .cloned()
                .ok_or(Status::Internal)?
        };
        sink.send_packet(&Packet::client_stream_end(self.key.route()))
    }

    /// Store a callback on the live entry. `FailedPrecondition` once the
    /// call is gone.
    pub(crate) fn set_callback(
        &self,
        set: impl FnOnce(&mut Callbacks),
    ) -> Result<(), Status> {
        self.core.update_call(self.key, self.token, |entry| set(&mut entry.callbacks))
    }

    /// Unregister without sending. Used by `Drop` and by cancellation.
    pub(crate) fn unregister(&self) -> Option<CallEntry> {
        self.core.unregister(self.key, self.token)
    }
}

impl Drop for CallRef {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for CallRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRef")
            .field("channel", &self.key.channel_id)
            .field("service", &self.key.service_id)
            .field("method", &self.key.method_id)
            .field("active", &self.active())
            .finish()
    }
}
