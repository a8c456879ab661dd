//! The packet router and the server side of calls.
//!
//! `Server::process_packet` is the single entry point for inbound bytes:
//! decode, resolve the channel, resolve the service and method, then
//! dispatch by packet type. Handlers run with no endpoint lock held, so they
//! may freely write responses, finish their call, or start transfers.

use std::sync::Arc;

use parking_lot::Mutex;
use tern_wire::{ChannelId, MethodId, Packet, PacketType, ServiceId, Status};

use crate::call::{CallKey, CallRef, CallSide, Callbacks, EndpointCore};
use crate::channel::ChannelSink;
use crate::method::{Invoker, MethodDescriptor, MethodKind};
use crate::service::Service;

/// Server behavior knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind an unknown channel id to the sink that delivered the packet.
    /// With this disabled, packets for unregistered channels are dropped.
    pub dynamic_channels: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            dynamic_channels: true,
        }
    }
}

/// Demultiplexes packets to services and methods and owns the active
/// server-side calls.
pub struct Server {
    core: Arc<EndpointCore>,
    services: Mutex<Vec<Arc<Service>>>,
    config: ServerConfig,
}

impl Default for Server {
    fn default() -> Server {
        Server::new(ServerConfig::default())
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            core: Arc::new(EndpointCore::default()),
            services: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Register a service.
    ///
    /// # Panics
    ///
    /// Panics if the service's id collides with one already registered;
    /// registration happens at start-up, and a collision would leave one of
    /// the services unreachable.
    pub fn register_service(&self, service: Service) {
        let mut services = self.services.lock();
        if let Some(existing) = services.iter().find(|s| s.id() == service.id()) {
            panic!(
                "service id collision: {:?} and {:?} both hash to {}",
                existing.name(),
                service.name(),
                service.id(),
            );
        }
        services.push(Arc::new(service));
    }

    /// Bind a channel up front. Returns false if the id is already bound.
    pub fn open_channel(&self, id: ChannelId, sink: ChannelSink) -> bool {
        self.core.bind_channel(id, sink)
    }

    /// Decode and route one packet. `source` is the sink of whatever
    /// transport delivered the bytes; it becomes the channel's sink when the
    /// channel id is new and dynamic channels are enabled.
    ///
    /// Routing failures that the peer can observe (unknown service or
    /// method, stream packets without a call) are reported to the peer with
    /// an error packet and return `Ok`; only failures that cannot be
    /// attributed to a caller (undecodable bytes, unknown channel with
    /// dynamic channels disabled) surface as `Err`.
    pub fn process_packet(&self, data: &[u8], source: &ChannelSink) -> Result<(), Status> {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable packet");
                let route = (ChannelId::new(0), ServiceId::new(0), MethodId::new(0));
                let _ = source.send_packet(&Packet::client_error(route, Status::DataLoss));
                return Err(Status::DataLoss);
            }
        };

        let sink = match self.core.channel_sink(packet.channel_id) {
            Some(sink) => sink,
            None if self.config.dynamic_channels => {
                tracing::debug!(channel = %packet.channel_id, "binding dynamic channel");
                self.core.bind_channel(packet.channel_id, source.clone());
                source.clone()
            }
            None => {
                tracing::warn!(channel = %packet.channel_id, "packet for unknown channel");
                return Err(Status::NotFound);
            }
        };

        let key = CallKey::from(packet.route());

        let Some(service) = self.find_service(packet.service_id) else {
            tracing::debug!(service = %packet.service_id, "unknown service");
            let _ = sink.send_packet(&Packet::server_error(key.route(), Status::NotFound));
            return Ok(());
        };
        let Some(method) = service.method(packet.method_id) else {
            tracing::debug!(service = %packet.service_id, method = %packet.method_id, "unknown method");
            let _ = sink.send_packet(&Packet::server_error(key.route(), Status::NotFound));
            return Ok(());
        };

        match packet.packet_type {
            PacketType::Request => self.start_call(method, key, &packet.payload, &sink),
            PacketType::ClientStream => {
                if self.core.call_accepts_client_stream(key) {
                    self.core.deliver_payload(key, &packet.payload);
                } else {
                    tracing::debug!(method = method.name(), "client stream packet without open call");
                    let _ =
                        sink.send_packet(&Packet::server_error(key.route(), Status::FailedPrecondition));
                }
            }
            PacketType::ClientStreamEnd => {
                if !self.core.deliver_client_stream_end(key) {
                    let _ =
                        sink.send_packet(&Packet::server_error(key.route(), Status::FailedPrecondition));
                }
            }
            PacketType::ClientError => {
                // The client is gone; tear the call down without replying.
                if self.core.fail_call(key, packet.status) {
                    tracing::debug!(method = method.name(), status = %packet.status, "call aborted by client");
                }
            }
            PacketType::Response | PacketType::ServerStream | PacketType::ServerError => {
                tracing::debug!(packet_type = ?packet.packet_type, "server-bound endpoint got a client-bound packet");
                let _ = sink.send_packet(&Packet::server_error(key.route(), Status::InvalidArgument));
            }
        }

        Ok(())
    }

    fn find_service(&self, id: ServiceId) -> Option<Arc<Service>> {
        self.services.lock().iter().find(|s| s.id() == id).cloned()
    }

    /// Begin a call for an inbound REQUEST. Any active call on the same key
    /// is aborted silently first; to the handler this is indistinguishable
    /// from the client restarting.
    fn start_call(&self, method: &MethodDescriptor, key: CallKey, payload: &[u8], sink: &ChannelSink) {
        match &method.invoker {
            Invoker::SyncUnary(handler) => {
                self.core.abort_call(key);
                let (response, status) = handler(payload);
                let packet = Packet::response(key.route(), response, status);
                if sink.send_packet(&packet).is_err() {
                    // The handler already ran and observed the request; all
                    // that can still be delivered is the failure itself.
                    let _ = sink.send_packet(&Packet::server_error(key.route(), Status::Internal));
                }
            }
            Invoker::AsyncUnary(handler) => {
                let responder = UnaryResponder {
                    call: self.open_server_call(key, MethodKind::Unary),
                };
                handler(payload, responder);
            }
            Invoker::ServerStreaming(handler) => {
                let writer = ServerWriter {
                    call: self.open_server_call(key, MethodKind::ServerStreaming),
                };
                handler(payload, writer);
            }
            Invoker::ClientStreaming(handler) => {
                let reader = ServerReader {
                    call: self.open_server_call(key, MethodKind::ClientStreaming),
                };
                handler(reader);
            }
            Invoker::BidirectionalStreaming(handler) => {
                let stream = ServerReaderWriter {
                    call: self.open_server_call(key, MethodKind::BidirectionalStreaming),
                };
                handler(stream);
            }
        }
    }

    fn open_server_call(&self, key: CallKey, kind: MethodKind) -> CallRef {
        let token = self.core.register_call(key, kind, Callbacks::default());
        CallRef::new(Arc::clone(&self.core), key, token, CallSide::Server)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.services.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "service id collision")]
    fn duplicate_service_registration_is_refused() {
        let server = Server::default();
        let make = || {
            Service::new("tern.test.Twice")
                .with_method(MethodDescriptor::unary("Noop", |_| (Vec::new(), Status::Ok)))
        };
        server.register_service(make());
        server.register_service(make());
    }
}

// ---------------------------------------------------------------------------
// Server-side call handles
// ---------------------------------------------------------------------------

/// Completes an asynchronous unary call. Move-only; dropping it without
/// calling [`finish`](UnaryResponder::finish) abandons the call silently.
pub struct UnaryResponder {
    call: CallRef,
}

impl UnaryResponder {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.call.key().channel_id
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    /// Send the RESPONSE and close the call.
    pub fn finish(self, response: &[u8], status: Status) -> Result<(), Status> {
        self.call.close_and_send(PacketType::Response, response, status)
    }
}

/// Sends the payloads of a server-streaming call.
pub struct ServerWriter {
    call: CallRef,
}

impl ServerWriter {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.call.key().channel_id
    }

    /// Largest payload one SERVER_STREAM packet can carry on this channel.
    pub fn payload_capacity(&self) -> Result<usize, Status> {
        self.call.payload_capacity()
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    /// Emit one SERVER_STREAM packet. `FailedPrecondition` once the call is
    /// finished or moved from; `Internal` if the payload cannot fit.
    pub fn write(&mut self, payload: &[u8]) -> Result<(), Status> {
        self.call.write(payload)
    }

    /// Send the terminating RESPONSE and close the call.
    pub fn finish(self, status: Status) -> Result<(), Status> {
        self.call.close_and_send(PacketType::Response, &[], status)
    }
}

/// Receives the payloads of a client-streaming call.
pub struct ServerReader {
    call: CallRef,
}

impl ServerReader {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.call.key().channel_id
    }

    /// Called for every CLIENT_STREAM payload, in wire order.
    pub fn set_on_next(&mut self, on_next: impl FnMut(&[u8]) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_next = Some(Box::new(on_next)));
    }

    /// Called when the client half-closes with CLIENT_STREAM_END.
    pub fn set_on_client_stream_end(&mut self, on_end: impl FnMut() + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_client_stream_end = Some(Box::new(on_end)));
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    /// Send the RESPONSE and close the call.
    pub fn finish(self, response: &[u8], status: Status) -> Result<(), Status> {
        self.call.close_and_send(PacketType::Response, response, status)
    }
}

/// Both directions of a bidirectional-streaming call.
pub struct ServerReaderWriter {
    call: CallRef,
}

impl ServerReaderWriter {
    pub fn active(&self) -> bool {
        self.call.active()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.call.key().channel_id
    }

    pub fn payload_capacity(&self) -> Result<usize, Status> {
        self.call.payload_capacity()
    }

    pub fn set_on_next(&mut self, on_next: impl FnMut(&[u8]) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_next = Some(Box::new(on_next)));
    }

    pub fn set_on_client_stream_end(&mut self, on_end: impl FnMut() + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_client_stream_end = Some(Box::new(on_end)));
    }

    pub fn set_on_error(&mut self, on_error: impl FnMut(Status) + Send + 'static) {
        let _ = self
            .call
            .set_callback(|callbacks| callbacks.on_error = Some(Box::new(on_error)));
    }

    pub fn write(&mut self, payload: &[u8]) -> Result<(), Status> {
        self.call.write(payload)
    }

    pub fn finish(self, status: Status) -> Result<(), Status> {
        self.call.close_and_send(PacketType::Response, &[], status)
    }
}
