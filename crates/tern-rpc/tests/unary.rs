//! Unary dispatch through the packet router.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tern_rpc::testing::{PacketLog, VectorOutput};
use tern_rpc::{
    ChannelId, ChannelSink, MethodDescriptor, MethodId, Packet, PacketType, Server, ServerConfig,
    Service, ServiceId, Status, UnaryResponder,
};

const CHANNEL: ChannelId = ChannelId::new(1);
const SERVICE: ServiceId = ServiceId::of("tern.test.Arithmetic");
const INCREMENT: MethodId = MethodId::of("Increment");

fn route() -> (ChannelId, ServiceId, MethodId) {
    (CHANNEL, SERVICE, INCREMENT)
}

/// Serves `Increment`: payload `[0x08, n]` comes back as `[0x08, n + 1]`.
fn increment_service(seen_request: Arc<AtomicBool>) -> Service {
    Service::new("tern.test.Arithmetic").with_method(MethodDescriptor::unary(
        "Increment",
        move |request| {
            seen_request.store(true, Ordering::SeqCst);
            match request {
                [0x08, value] => (vec![0x08, value.wrapping_add(1)], Status::Ok),
                _ => (Vec::new(), Status::InvalidArgument),
            }
        },
    ))
}

fn server_with(service: Service, mtu: usize) -> (Server, ChannelSink, PacketLog) {
    let output = VectorOutput::new(mtu);
    let log = output.log();
    let sink = ChannelSink::new(output);
    let server = Server::new(ServerConfig::default());
    server.register_service(service);
    (server, sink, log)
}

#[test]
fn unary_round_trip() {
    let seen = Arc::new(AtomicBool::new(false));
    let (server, sink, log) = server_with(increment_service(Arc::clone(&seen)), 128);

    let request = Packet::request(route(), vec![0x08, 0x7b]).encode();
    server.process_packet(&request, &sink).unwrap();

    assert!(seen.load(Ordering::SeqCst));
    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0],
        Packet::response(route(), vec![0x08, 0x7c], Status::Ok)
    );
}

#[test]
fn response_that_does_not_fit_becomes_internal_error() {
    let seen = Arc::new(AtomicBool::new(false));
    let seen_in_handler = Arc::clone(&seen);
    let service = Service::new("tern.test.Arithmetic").with_method(MethodDescriptor::unary(
        "Increment",
        move |_request| {
            seen_in_handler.store(true, Ordering::SeqCst);
            (vec![0xab; 32], Status::Ok)
        },
    ));

    // A 22-byte output can carry the error packet but not the response.
    let (server, sink, log) = server_with(service, 22);

    let request = Packet::request(route(), vec![0x08, 0x7b]).encode();
    server.process_packet(&request, &sink).unwrap();

    // The handler still observed the request.
    assert!(seen.load(Ordering::SeqCst));

    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ServerError);
    assert_eq!(packets[0].status, Status::Internal);
    assert_eq!(packets[0].service_id, SERVICE);
    assert_eq!(packets[0].method_id, INCREMENT);
}

#[test]
fn unknown_service_is_not_found() {
    let (server, sink, log) = server_with(increment_service(Arc::default()), 128);

    let bogus = (CHANNEL, ServiceId::of("tern.test.Missing"), INCREMENT);
    let request = Packet::request(bogus, Vec::new()).encode();
    server.process_packet(&request, &sink).unwrap();

    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ServerError);
    assert_eq!(packets[0].status, Status::NotFound);
    assert_eq!(packets[0].service_id, ServiceId::of("tern.test.Missing"));
}

#[test]
fn unknown_method_is_not_found() {
    let (server, sink, log) = server_with(increment_service(Arc::default()), 128);

    let bogus = (CHANNEL, SERVICE, MethodId::of("Decrement"));
    let request = Packet::request(bogus, Vec::new()).encode();
    server.process_packet(&request, &sink).unwrap();

    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ServerError);
    assert_eq!(packets[0].status, Status::NotFound);
    assert_eq!(packets[0].method_id, MethodId::of("Decrement"));
}

#[test]
fn undecodable_bytes_draw_a_data_loss_error() {
    let (server, sink, log) = server_with(increment_service(Arc::default()), 128);

    // Wire type 7 does not exist.
    let result = server.process_packet(&[0xff, 0xff], &sink);
    assert_eq!(result, Err(Status::DataLoss));

    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ClientError);
    assert_eq!(packets[0].status, Status::DataLoss);
}

#[test]
fn client_bound_packets_are_rejected() {
    let (server, sink, log) = server_with(increment_service(Arc::default()), 128);

    let response = Packet::response(route(), Vec::new(), Status::Ok).encode();
    server.process_packet(&response, &sink).unwrap();

    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::ServerError);
    assert_eq!(packets[0].status, Status::InvalidArgument);
}

#[test]
fn dynamic_channels_can_be_disabled() {
    let output = VectorOutput::new(128);
    let log = output.log();
    let sink = ChannelSink::new(output);
    let server = Server::new(ServerConfig {
        dynamic_channels: false,
    });
    server.register_service(increment_service(Arc::default()));

    let request = Packet::request(route(), vec![0x08, 0x01]).encode();
    assert_eq!(server.process_packet(&request, &sink), Err(Status::NotFound));
    assert!(log.is_empty());

    // Once the channel is opened explicitly, the same packet goes through.
    server.open_channel(CHANNEL, sink.clone());
    server.process_packet(&request, &sink).unwrap();
    assert_eq!(log.len(), 1);
}

// ---------------------------------------------------------------------------
// Asynchronous unary
// ---------------------------------------------------------------------------

type ResponderSlot = Arc<Mutex<Option<UnaryResponder>>>;

fn deferred_service(slot: ResponderSlot) -> Service {
    Service::new("tern.test.Deferred").with_method(MethodDescriptor::unary_async(
        "Later",
        move |_request, responder| {
            slot.lock().replace(responder);
        },
    ))
}

#[test]
fn async_unary_responds_when_finished() {
    let slot: ResponderSlot = Arc::default();
    let (server, sink, log) = server_with(deferred_service(Arc::clone(&slot)), 128);

    let deferred_route = (CHANNEL, ServiceId::of("tern.test.Deferred"), MethodId::of("Later"));
    let request = Packet::request(deferred_route, vec![1]).encode();
    server.process_packet(&request, &sink).unwrap();

    // Nothing is sent until the responder finishes.
    assert!(log.is_empty());

    let responder = slot.lock().take().unwrap();
    assert!(responder.active());
    responder.finish(&[0x2a], Status::Ok).unwrap();

    let packets = log.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0],
        Packet::response(deferred_route, vec![0x2a], Status::Ok)
    );
}

#[test]
fn request_replaces_pending_async_call_silently() {
    let slot: ResponderSlot = Arc::default();
    let (server, sink, log) = server_with(deferred_service(Arc::clone(&slot)), 128);

    let deferred_route = (CHANNEL, ServiceId::of("tern.test.Deferred"), MethodId::of("Later"));
    let request = Packet::request(deferred_route, Vec::new()).encode();

    server.process_packet(&request, &sink).unwrap();
    let first = slot.lock().take().unwrap();

    // The client restarts the call; no packet is emitted for the abort.
    server.process_packet(&request, &sink).unwrap();
    assert!(log.is_empty());

    // The replaced responder is dead; the new one answers normally.
    assert!(!first.active());
    assert_eq!(
        first.finish(&[], Status::Ok),
        Err(Status::FailedPrecondition)
    );

    let second = slot.lock().take().unwrap();
    second.finish(&[], Status::Ok).unwrap();
    assert_eq!(log.len(), 1);
}

#[test]
fn exactly_one_response_per_successful_unary_exchange() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);
    let service = Service::new("tern.test.Arithmetic").with_method(MethodDescriptor::unary(
        "Increment",
        move |_| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            (Vec::new(), Status::Ok)
        },
    ));
    let (server, sink, log) = server_with(service, 128);

    let request = Packet::request(route(), Vec::new()).encode();
    for _ in 0..3 {
        server.process_packet(&request, &sink).unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let packets = log.packets();
    assert_eq!(packets.len(), 3);
    assert!(packets
        .iter()
        .all(|p| p.packet_type == PacketType::Response && p.status == Status::Ok));
}
