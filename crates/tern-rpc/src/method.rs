//! Method descriptors.
//!
//! Every method a service exposes is described by one [`MethodDescriptor`]:
//! its hashed id, its kind, and an invoker that adapts the user's handler to
//! the uniform dispatch interface. The invoker shape differs per kind but
//! dispatch only ever sees the tagged enum, so all methods route through the
//! same code path in the server.

use tern_wire::{MethodId, Status};

use crate::server::{ServerReader, ServerReaderWriter, ServerWriter, UnaryResponder};

/// The four call patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidirectionalStreaming,
}

impl MethodKind {
    /// True for kinds whose client sends CLIENT_STREAM packets.
    pub fn has_client_stream(self) -> bool {
        matches!(
            self,
            MethodKind::ClientStreaming | MethodKind::BidirectionalStreaming
        )
    }

    /// True for kinds whose server sends SERVER_STREAM packets.
    pub fn has_server_stream(self) -> bool {
        matches!(
            self,
            MethodKind::ServerStreaming | MethodKind::BidirectionalStreaming
        )
    }
}

/// Type-erased handler, selected at registration time.
pub(crate) enum Invoker {
    /// Runs to completion during dispatch; the response is sent on return.
    SyncUnary(Box<dyn Fn(&[u8]) -> (Vec<u8>, Status) + Send + Sync>),
    /// Receives a responder and finishes the call later.
    AsyncUnary(Box<dyn Fn(&[u8], UnaryResponder) + Send + Sync>),
    ServerStreaming(Box<dyn Fn(&[u8], ServerWriter) + Send + Sync>),
    ClientStreaming(Box<dyn Fn(ServerReader) + Send + Sync>),
    BidirectionalStreaming(Box<dyn Fn(ServerReaderWriter) + Send + Sync>),
}

/// One dispatchable method of a service.
pub struct MethodDescriptor {
    id: MethodId,
    name: &'static str,
    kind: MethodKind,
    pub(crate) invoker: Invoker,
}

impl MethodDescriptor {
    fn new(name: &'static str, kind: MethodKind, invoker: Invoker) -> MethodDescriptor {
        MethodDescriptor {
            id: MethodId::of(name),
            name,
            kind,
            invoker,
        }
    }

    /// A synchronous unary method. The handler returns the response payload
    /// and status; the server encodes and sends the RESPONSE packet.
    pub fn unary(
        name: &'static str,
        handler: impl Fn(&[u8]) -> (Vec<u8>, Status) + Send + Sync + 'static,
    ) -> MethodDescriptor {
        MethodDescriptor::new(name, MethodKind::Unary, Invoker::SyncUnary(Box::new(handler)))
    }

    /// An asynchronous unary method. The call stays active until the handler
    /// (or whoever it hands the responder to) calls
    /// [`UnaryResponder::finish`].
    pub fn unary_async(
        name: &'static str,
        handler: impl Fn(&[u8], UnaryResponder) + Send + Sync + 'static,
    ) -> MethodDescriptor {
        MethodDescriptor::new(name, MethodKind::Unary, Invoker::AsyncUnary(Box::new(handler)))
    }

    pub fn server_streaming(
        name: &'static str,
        handler: impl Fn(&[u8], ServerWriter) + Send + Sync + 'static,
    ) -> MethodDescriptor {
        MethodDescriptor::new(
            name,
            MethodKind::ServerStreaming,
            Invoker::ServerStreaming(Box::new(handler)),
        )
    }

    pub fn client_streaming(
        name: &'static str,
        handler: impl Fn(ServerReader) + Send + Sync + 'static,
    ) -> MethodDescriptor {
        MethodDescriptor::new(
            name,
            MethodKind::ClientStreaming,
            Invoker::ClientStreaming(Box::new(handler)),
        )
    }

    pub fn bidi_streaming(
        name: &'static str,
        handler: impl Fn(ServerReaderWriter) + Send + Sync + 'static,
    ) -> MethodDescriptor {
        MethodDescriptor::new(
            name,
            MethodKind::BidirectionalStreaming,
            Invoker::BidirectionalStreaming(Box::new(handler)),
        )
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
