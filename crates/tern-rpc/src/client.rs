//! The client side: issuing calls and routing their packets back.
//!
//! A `Client` tracks in-flight calls by `(channel, service, method)` and
//! hands inbound packets to their callbacks. Invoking a method on a key
//! that already has an active call replaces the old call atomically: its
//! callbacks are dropped and no error fires, exactly as if the caller
//! restarted the exchange.

use std::sync::Arc;

use tern_wire::{ChannelId, MethodId, Packet, PacketType, ServiceId, Status};

use crate::call::{CallKey, CallRef, CallSide, Callbacks, EndpointCore};
use crate::channel::ChannelSink;
use crate::method::MethodKind;

/// Issues outbound calls and dispatches their inbound packets.
#[derive(Default)]
pub struct Client {
    core: Arc<EndpointCore>,
}

impl Client {
    pub fn new() -> Client {
        Client::default()
    }

    /// Bind a channel. Returns false if the id is already bound.
    pub fn open_channel(&self, id: ChannelId, sink: ChannelSink) -> bool {
        self.core.bind_channel(id, sink)
    }

    /// Decode one packet and deliver it to its call.
    ///
    /// Packets for calls that are no longer active (duplicate RESPONSE,
    /// late SERVER_STREAM) are dropped quietly.
    pub fn process_packet(&self, data: &[u8]) -> Result<(), Status> {
        let packet = Packet::decode(data).map_err(|error| {
            tracing::warn!(%error, "dropping undecodable packet");
            Status::DataLoss
        })?;

        let key = CallKey::from(packet.route());
        match packet.packet_type {
            PacketType::Response => {
                if !self.core.complete_call(key, &packet.payload, packet.status) {
                    tracing::trace!(method = %key.method_id, "response for inactive call");
                }
                Ok(())
            }
            PacketType::ServerStream => {
                if !self.core.deliver_payload(key, &packet.payload) {
                    tracing::trace!(method = %key.method_id, "stream payload for inactive call");
                }
                Ok(())
            }
            PacketType::ServerError => {
                if !self.core.fail_call(key, packet.status) {
                    tracing::trace!(method = %key.method_id, "error for inactive call");
                }
                Ok(())
            }
            other => {
                tracing::debug!(packet_type = ?other, "client got a server-bound packet");
                Err(Status::InvalidArgument)
            }
        }
    }

    /// Start a unary call. `on_completed` receives the response payload and
    /// terminal status; `on_error` fires instead if the server tears the
    /// call down with SERVER_ERROR.
    pub fn invoke_unary(
        &self,
        channel_id: ChannelId,
        service_id: ServiceId,
        method_id: MethodId,
        request: &[u8],
        on_completed: impl FnMut(&[u8], Status) + Send + 'static,
        on_error: impl FnMut(Status) + Send + 'static,
    ) -> Result<UnaryCall, Status> {
        let callbacks = Callbacks {
            on_completed: Some(Box::new(on_completed)),
            on_error: Some(Box::new(on_error)),
            ..Callbacks::default()
        };
        let call = self.start_call(
            (channel_id, service_id, method_id).into(),
            MethodKind::Unary,
            callbacks,
            request,
        )?;
        Ok(UnaryCall { call })
    }

    /// Start a server-streaming call. Set callbacks on the returned reader.
    pub fn invoke_server_streaming(
        &self,
        channel_id: ChannelId,
        service_id: ServiceId,
        method_id: MethodId,
        request: &[u8],
    ) -> Result<ClientReader, Status> {
        let call = self.start_call(
            (channel_id, service_id, method_id).into(),
            MethodKind::ServerStreaming,
            Callbacks::default(),
            request,
        )?;
        Ok(ClientReader { call })
    }

    /// Start a client-streaming call. The REQUEST carries no payload; data
    /// follows through [`ClientWriter::write`].
    pub fn invoke_client_streaming(
        &self,
        channel_id: ChannelId,
        service_id: ServiceId,
        method_id: MethodId,
    ) -> Result<ClientWriter, Status> {
        let call = self.start_call(
            (channel_id, service_id, method_id).into(),
            MethodKind::ClientStreaming,
            Callbacks::default(),
            &[],
        )?;
        Ok(ClientWriter { call })
    }

    /// Start a bidirectional-streaming call.
    pub fn invoke_bidirectional(
        &self,
        channel_id: ChannelId,
        service_id: ServiceId,
        method_id: MethodId,
    ) -> Result<ClientReaderWriter, Status> {
        let call = self.start_call(
            (channel_id, service_id, method_id).into(),
            MethodKind::BidirectionalStreaming,
            Callbacks::default(),
            &[],
        )?;
        Ok(ClientReaderWriter { call })
    }

    fn start_call(
        &self,
        key: CallKey,
        kind: MethodKind,
        callbacks: Callbacks,
        request: &[u8],
    ) -> Result<CallRef, Status> {
        let sink = self
            .core
            .channel_sink(key.channel_id)
            .ok_or(Status::NotFound)?;

        // Registration replaces any active call on this key before the new
        // REQUEST goes out; the old call's callbacks are simply dropped.
        let token = self.core.register_call(key, kind, callbacks);
        let call = CallRef::new(Arc::clone(&self.core), key, token, CallSide::Client);

        sink.send_packet(&Packet::request(key.route(), request.to_vec()))
            .map(|()| call)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Client-side call handles
// ---------------------------------------------------------------------------

fn cancel(call: &CallRef) -> Result<(), Status> {
    call.close_and_send(PacketType::ClientError, &[], Status::Cancelled)
}

/// Handle to an in-flight unary call.
pub struct UnaryCall {
    call: CallRef,
}

impl UnaryCall {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    /// Abort the call: emits CLIENT_ERROR with CANCELLED and suppresses all
    /// further callbacks. `FailedPrecondition` if the call already ended.
    pub fn cancel(&mut self) -> Result<(), Status> {
        cancel(&self.call)
    }
}

/// Handle to a server-streaming call.
pub struct ClientReader {
    call: CallRef,
}

impl ClientReader {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    /// Called for every SERVER_STREAM payload, in wire order.
    pub fn set_on_next(&mut self, on_next: impl FnMut(&[u8]) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_next = Some(Box::new(on_next)));
    }

    /// Called once with the terminating RESPONSE; the last callback to fire.
    pub fn set_on_completed(&mut self, on_completed: impl FnMut(&[u8], Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_completed = Some(Box::new(on_completed)));
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    pub fn cancel(&mut self) -> Result<(), Status> {
        cancel(&self.call)
    }
}

/// Handle to a client-streaming call.
pub struct ClientWriter {
    call: CallRef,
}

impl ClientWriter {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    /// Largest payload one CLIENT_STREAM packet can carry on this channel.
    pub fn payload_capacity(&self) -> Result<usize, Status> {
        self.call.payload_capacity()
    }

    /// Emit one CLIENT_STREAM packet. `FailedPrecondition` after the stream
    /// was half-closed or the call ended.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), Status> {
        self.call.write(payload)
    }

    /// Half-close: no more payloads will follow, but the call stays active
    /// until the server's RESPONSE.
    pub fn close_client_stream(&mut self) -> Result<(), Status> {
        self.call.end_client_stream()
    }

    pub fn set_on_completed(&mut self, on_completed: impl FnMut(&[u8], Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_completed = Some(Box::new(on_completed)));
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    pub fn cancel(&mut self) -> Result<(), Status> {
        cancel(&self.call)
    }
}

/// Handle to a bidirectional-streaming call.
pub struct ClientReaderWriter {
    call: CallRef,
}

impl ClientReaderWriter {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    /// Largest payload one CLIENT_STREAM packet can carry on this channel.
    pub fn payload_capacity(&self) -> Result<usize, Status> {
        self.call.payload_capacity()
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<(), Status> {
        self.call.write(payload)
    }

    pub fn close_client_stream(&mut self) -> Result<(), Status> {
        self.call.end_client_stream()
    }

    pub fn set_on_next(&mut self, on_next: impl FnMut(&[u8]) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_next = Some(Box::new(on_next)));
    }

    pub fn set_on_completed(&mut self, on_completed: impl FnMut(&[u8], Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_completed = Some(Box::new(on_completed)));
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    pub fn cancel(&mut self) -> Result<(), Status> {
        cancel(&self.call)
    }
}
