use std::path::Path;
use std::sync::Arc;

use crate::{
    sender::{Sender, SenderError},
    telemetry::Telemetry,
    transport::RemoteAddr,
};

/// Client-side delivery engine for pre-encoded metric lines.
///
/// A `Forwarder` accepts opaque, already-encoded messages and delivers them, batched, to a local collector over UDP
/// or a Unix domain socket. Delivery is best-effort and asynchronous: [`send`](Self::send) enqueues and returns
/// immediately, a single background worker packs messages into size-bounded payloads and writes them out, and an
/// optional timer flushes on an interval. [`flush`](Self::flush) with `sync` gives a true "delivered to the socket"
/// barrier when needed.
///
/// The pipeline is live from construction (see [`ForwarderBuilder`](crate::ForwarderBuilder)) until
/// [`close`](Self::close) or drop, and shuts down without losing already-accepted messages.
pub struct Forwarder {
    sender: Sender,
    telemetry: Option<Arc<Telemetry>>,
    remote_addr: RemoteAddr,
}

impl Forwarder {
    pub(crate) fn new(
        sender: Sender,
        telemetry: Option<Arc<Telemetry>>,
        remote_addr: RemoteAddr,
    ) -> Self {
        Forwarder { sender, telemetry, remote_addr }
    }

    /// Enqueues one encoded message for delivery.
    ///
    /// Returns as soon as the message is queued; it reaches the buffer, and eventually the socket, asynchronously in
    /// submission order. If telemetry is enabled and due, its snapshot is flushed into the pipeline on the way out.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the forwarder has been closed.
    pub fn send<M>(&self, message: M) -> Result<(), SenderError>
    where
        M: Into<String>,
    {
        self.sender.submit(message.into())?;
        self.tick_telemetry();

        Ok(())
    }

    /// Flushes buffered messages to the transport.
    ///
    /// With `flush_telemetry`, a telemetry snapshot is submitted first (when telemetry is enabled). With `sync`, this
    /// blocks until everything enqueued before the call, including the flush itself, has been applied.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the forwarder has been closed.
    pub fn flush(&self, flush_telemetry: bool, sync: bool) -> Result<(), SenderError> {
        if flush_telemetry {
            if let Some(telemetry) = &self.telemetry {
                self.flush_telemetry(telemetry);
            }
        }

        self.sender.flush(sync)
    }

    /// Blocks until the worker thread has applied every entry enqueued before this call.
    ///
    /// Unlike [`flush`](Self::flush) with `sync`, no flush marker is enqueued: this only waits for the worker to
    /// catch up with the submission order.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the forwarder has been closed.
    pub fn sync_with_outbound_io(&self) -> Result<(), SenderError> {
        self.sender.rendezvous()
    }

    /// The remote host, when forwarding over UDP.
    pub fn host(&self) -> Option<&str> {
        self.remote_addr.host()
    }

    /// The remote port, when forwarding over UDP.
    pub fn port(&self) -> Option<u16> {
        self.remote_addr.port()
    }

    /// The remote socket path, when forwarding over a Unix domain socket.
    pub fn socket_path(&self) -> Option<&Path> {
        self.remote_addr.socket_path()
    }

    /// Shuts the pipeline down.
    ///
    /// Every message accepted before this call is drained to the buffer, the buffer is flushed one final time, and
    /// the transport is closed. Subsequent calls are no-ops; subsequent [`send`](Self::send)s fail with a usage
    /// error.
    pub fn close(&self) {
        // Already closed: nothing left to do.
        if self.sender.stop(true).is_err() {
            return;
        }

        self.sender.with_buffer(|buffer| buffer.close());

        // Whatever accumulated after the final snapshot will never be reported.
        if let Some(telemetry) = &self.telemetry {
            telemetry.reset();
        }
    }

    fn tick_telemetry(&self) {
        if let Some(telemetry) = &self.telemetry {
            if telemetry.should_flush() {
                self.flush_telemetry(telemetry);
            }
        }
    }

    fn flush_telemetry(&self, telemetry: &Telemetry) {
        for line in telemetry.flush() {
            // Telemetry rides the same pipeline as user metrics; if the queue is gone, the report is gone too.
            if self.sender.submit(line).is_err() {
                break;
            }
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.close();
    }
}
