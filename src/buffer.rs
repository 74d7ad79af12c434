use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::{telemetry::Telemetry, transport::Transport};

/// Rule applied when the buffer's pooled regions are exhausted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowStrategy {
    /// Discard the message and record a telemetry drop.
    #[default]
    Drop,

    /// Surface a capacity error instead of silently dropping.
    Raise,
}

/// Buffering failures.
#[derive(Debug, Error)]
pub enum BufferError {
    /// All pooled payload regions are full and the overflow strategy is [`OverflowStrategy::Raise`].
    #[error("message of {len} bytes exceeds remaining buffering capacity")]
    Overflow {
        /// Length of the message that could not be buffered.
        len: usize,
    },
}

/// Packs encoded messages into size-bounded payload regions for the transport.
///
/// Messages are newline-delimited inside a region, so multiple metric lines travel in a single transport write. The
/// active region never exceeds `max_payload_size` bytes; when a message does not fit, the active region is written out
/// and a replacement region is taken from a fixed-size pool.
///
/// A region handed to the transport is parked and only returns to the free pool on the next [`flush`](Self::flush),
/// which bounds the pipeline's memory and write rate at `max_pool_size * max_payload_size` bytes per flush interval.
/// When the pool is exhausted the configured [`OverflowStrategy`] applies.
///
/// The buffer is exclusively owned and mutated by the worker thread, so it needs no interior locking.
pub(crate) struct MessageBuffer {
    transport: Transport,
    telemetry: Option<Arc<Telemetry>>,
    max_payload_size: usize,
    max_pool_size: usize,
    overflow_strategy: OverflowStrategy,
    active: Vec<u8>,
    free: Vec<Vec<u8>>,
    spent: Vec<Vec<u8>>,
    allocated: usize,
}

impl MessageBuffer {
    /// Creates a new `MessageBuffer` writing to the given transport.
    pub fn new(
        transport: Transport,
        telemetry: Option<Arc<Telemetry>>,
        max_payload_size: usize,
        max_pool_size: usize,
        overflow_strategy: OverflowStrategy,
    ) -> Self {
        // NOTE: This is also validated in the builder, but we double check here that we're getting sane values.
        assert!(max_payload_size > 0, "maximum payload size must be greater than zero");
        assert!(max_pool_size > 0, "maximum pool size must be greater than zero");

        Self {
            transport,
            telemetry,
            max_payload_size,
            max_pool_size,
            overflow_strategy,
            active: Vec::with_capacity(max_payload_size),
            free: Vec::new(),
            spent: Vec::new(),
            // The active region counts against the pool.
            allocated: 1,
        }
    }

    /// Appends one encoded message to the active region.
    ///
    /// If the message (plus its separator) does not fit in the active region, the active region is first handed to the
    /// transport and a replacement region is taken from the pool. With the pool exhausted, or for a message that could
    /// never fit in an empty region, the overflow strategy applies.
    pub fn add(&mut self, message: &str) -> Result<(), BufferError> {
        let required = message.len() + 1;

        // A message bigger than a whole region can never be packed.
        if required > self.max_payload_size {
            return self.overflow(message.len());
        }

        if self.active.len() + required > self.max_payload_size && !self.rotate_region() {
            return self.overflow(message.len());
        }

        self.active.extend_from_slice(message.as_bytes());
        self.active.push(b'\n');

        if let Some(telemetry) = &self.telemetry {
            telemetry.track_message_sent();
        }

        Ok(())
    }

    /// Writes the active region to the transport and recycles spent regions back into the pool.
    ///
    /// No-op when there is nothing to write or recycle.
    pub fn flush(&mut self) {
        if !self.active.is_empty() {
            self.transport.write(&self.active);
            self.active.clear();
        }

        for mut region in self.spent.drain(..) {
            region.clear();
            self.free.push(region);
        }
    }

    /// Flushes any remaining content and closes the transport.
    pub fn close(&mut self) {
        self.flush();
        self.transport.close();
    }

    /// Hands the full active region to the transport and installs a replacement from the pool.
    ///
    /// The replacement is acquired first: if the pool is exhausted nothing is written and the active region is left
    /// untouched, so the caller can apply the overflow strategy.
    fn rotate_region(&mut self) -> bool {
        let replacement = match self.free.pop() {
            Some(region) => region,
            None if self.allocated < self.max_pool_size => {
                self.allocated += 1;
                Vec::with_capacity(self.max_payload_size)
            }
            None => return false,
        };

        let full = std::mem::replace(&mut self.active, replacement);
        self.transport.write(&full);
        self.spent.push(full);

        true
    }

    fn overflow(&mut self, len: usize) -> Result<(), BufferError> {
        if let Some(telemetry) = &self.telemetry {
            telemetry.track_message_dropped(len);
        }

        match self.overflow_strategy {
            OverflowStrategy::Drop => {
                warn!(len, "Dropping message: buffering capacity exhausted.");
                Ok(())
            }
            OverflowStrategy::Raise => Err(BufferError::Overflow { len }),
        }
    }
}
