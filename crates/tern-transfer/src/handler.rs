//! Per-resource transfer handlers registered with the server service.
//!
//! A handler owns the byte stream behind one transfer id and gets bracketed
//! callbacks around each session: `prepare_*` when a client opens the
//! session, `finalize_*` when it ends (successfully or not). Handlers must
//! not call back into the service they are registered with; they are invoked
//! while the service is processing a chunk.

use tern_wire::Status;

use crate::stream::{Reader, Writer};

/// Serves read transfers (client pulls data) for one transfer id.
pub trait ReadHandler: Send {
    /// A client is opening a read session. Reset the reader to its start;
    /// returning an error refuses this attempt but leaves the handler
    /// registered, so a later attempt may succeed.
    fn prepare_read(&mut self) -> Result<(), Status>;

    /// The session ended with `status`. Always called exactly once per
    /// prepared session.
    fn finalize_read(&mut self, status: Status);

    /// The source to serve data from. Only called between a successful
    /// `prepare_read` and the matching `finalize_read`.
    fn reader(&mut self) -> &mut dyn Reader;
}

/// Serves write transfers (client pushes data) for one transfer id.
pub trait WriteHandler: Send {
    /// A client is opening a write session.
    fn prepare_write(&mut self) -> Result<(), Status>;

    /// The session ended with `status`. The returned status is reported to
    /// the client for successful sessions: returning an error turns an
    /// otherwise-complete transfer into a `DataLoss` failure (e.g. a final
    /// flush or checksum failed).
    fn finalize_write(&mut self, status: Status) -> Result<(), Status>;

    /// The sink to write received data into. Only called between a
    /// successful `prepare_write` and the matching `finalize_write`.
    fn writer(&mut self) -> &mut dyn Writer;
}
