use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    buffer::{MessageBuffer, OverflowStrategy},
    forwarder::Forwarder,
    sender::Sender,
    telemetry::Telemetry,
    transport::{RemoteAddr, Transport, TransportConfig},
};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_POOL_SIZE: usize = 64;

// Default payload sizes differ by transport: UDP payloads are kept under the conservative ethernet-path MTU budget,
// Unix domain sockets can carry more per write.
const UDP_DEFAULT_MAX_PAYLOAD_SIZE: usize = 1432;
const UDS_DEFAULT_MAX_PAYLOAD_SIZE: usize = 8192;

/// Errors that could occur while building a [`Forwarder`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The configured maximum payload size cannot hold any message.
    #[error("buffer_max_payload_size must be greater than zero")]
    InvalidPayloadSize,

    /// The configured maximum pool size cannot hold any region.
    #[error("buffer_max_pool_size must be greater than zero")]
    InvalidPoolSize,

    /// Telemetry is enabled but a worst-case snapshot cannot fit in one payload.
    #[error("buffer_max_payload_size of {configured} bytes cannot hold a telemetry snapshot (needs at least {required})")]
    TelemetryTooLarge {
        /// The configured maximum payload size.
        configured: usize,
        /// The worst-case encoded size of one telemetry snapshot.
        required: usize,
    },

    /// Failed to spawn the background threads driving the pipeline.
    #[error("failed to spawn background thread for the send pipeline")]
    Backend,
}

/// Builder for a [`Forwarder`].
pub struct ForwarderBuilder {
    remote_addr: RemoteAddr,
    write_timeout: Duration,
    max_payload_size: Option<usize>,
    max_pool_size: usize,
    overflow_strategy: OverflowStrategy,
    flush_interval: Option<Duration>,
    telemetry_flush_interval: Option<Duration>,
    global_tags: Vec<String>,
}

impl ForwarderBuilder {
    /// Set the remote address to forward messages to.
    ///
    /// For UDP, the address simply needs to be in the format of `<host>:<port>`. For a Unix domain socket in stream
    /// mode, use `unix://<path>`; the presence of a socket path is what selects the stream transport.
    ///
    /// Defaults to sending to `127.0.0.1:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the write timeout for a single transport write.
    ///
    /// When the write timeout is reached, the write operation is aborted and the payload being sent at the time is
    /// dropped without retrying.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum payload size, in bytes.
    ///
    /// This bounds the size of a single transport write: messages are packed into payloads of at most this size.
    /// This should generally be set to the same value (or lower) as the receive buffer size of the collector.
    ///
    /// Defaults to 1432 bytes for UDP and 8192 bytes for Unix domain sockets.
    #[must_use]
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = Some(max_payload_size);
        self
    }

    /// Set the maximum number of pooled payload regions.
    ///
    /// Together with the maximum payload size, this bounds how much data the pipeline will buffer between flushes.
    /// When all regions are full, the overflow strategy applies.
    ///
    /// Defaults to 64.
    #[must_use]
    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Set the strategy applied when buffering capacity saturates.
    ///
    /// Defaults to [`OverflowStrategy::Drop`].
    #[must_use]
    pub fn with_overflow_strategy(mut self, strategy: OverflowStrategy) -> Self {
        self.overflow_strategy = strategy;
        self
    }

    /// Set the interval at which the buffer is flushed by a background timer.
    ///
    /// When not set, no timer thread is spawned and the buffer is only flushed when full or on demand.
    ///
    /// Defaults to unset.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = Some(flush_interval);
        self
    }

    /// Set the interval at which the pipeline reports its own telemetry.
    ///
    /// Telemetry counters (messages, bytes, and packets, sent and dropped) are encoded as ordinary messages and
    /// delivered through the same pipeline they measure. When not set, telemetry is disabled entirely.
    ///
    /// Defaults to unset.
    #[must_use]
    pub fn with_telemetry_flush_interval(mut self, telemetry_flush_interval: Duration) -> Self {
        self.telemetry_flush_interval = Some(telemetry_flush_interval);
        self
    }

    /// Set the tags attached to every telemetry line, in order.
    ///
    /// Each tag is either `key:value` or a bare `value`.
    ///
    /// Defaults to empty.
    #[must_use]
    pub fn with_global_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.global_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builds the forwarder and starts its pipeline.
    ///
    /// The returned forwarder is live: its worker (and timer, if a flush interval was configured) threads are running
    /// and it accepts messages until [`close`](Forwarder::close) is called or it is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid (zero payload or pool size, or a payload size too small to
    /// ever report telemetry), or if a background thread could not be spawned.
    pub fn build(self) -> Result<Forwarder, BuildError> {
        let max_payload_size = self.max_payload_size.unwrap_or(match &self.remote_addr {
            RemoteAddr::Udp { .. } => UDP_DEFAULT_MAX_PAYLOAD_SIZE,
            #[cfg(target_os = "linux")]
            RemoteAddr::Unix(_) => UDS_DEFAULT_MAX_PAYLOAD_SIZE,
        });
        if max_payload_size == 0 {
            return Err(BuildError::InvalidPayloadSize);
        }
        if self.max_pool_size == 0 {
            return Err(BuildError::InvalidPoolSize);
        }

        let telemetry = self.telemetry_flush_interval.map(|interval| {
            Arc::new(Telemetry::new(interval, self.remote_addr.transport_id(), &self.global_tags))
        });

        if let Some(telemetry) = &telemetry {
            if !telemetry.would_fit_in(max_payload_size) {
                return Err(BuildError::TelemetryTooLarge {
                    configured: max_payload_size,
                    required: telemetry.worst_case_len(),
                });
            }
        }

        let transport = Transport::new(
            TransportConfig {
                remote_addr: self.remote_addr.clone(),
                write_timeout: self.write_timeout,
            },
            telemetry.clone(),
        );

        let buffer = MessageBuffer::new(
            transport,
            telemetry.clone(),
            max_payload_size,
            self.max_pool_size,
            self.overflow_strategy,
        );

        let sender = Sender::new(buffer, self.flush_interval);
        sender.start().map_err(|_| BuildError::Backend)?;

        Ok(Forwarder::new(sender, telemetry, self.remote_addr))
    }
}

impl Default for ForwarderBuilder {
    fn default() -> Self {
        ForwarderBuilder {
            remote_addr: RemoteAddr::Udp {
                host: "127.0.0.1".to_string(),
                port: 8125,
                addrs: vec![SocketAddr::from(([127, 0, 0, 1], 8125))],
            },
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_payload_size: None,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            overflow_strategy: OverflowStrategy::Drop,
            flush_interval: None,
            telemetry_flush_interval: None,
            global_tags: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{BuildError, ForwarderBuilder};

    #[test]
    fn rejects_invalid_remote_address() {
        let result = ForwarderBuilder::default().with_remote_address("not-an-address");
        assert!(matches!(result, Err(BuildError::InvalidRemoteAddress { .. })));
    }

    #[test]
    fn rejects_zero_payload_size() {
        let result = ForwarderBuilder::default().with_max_payload_size(0).build();
        assert!(matches!(result, Err(BuildError::InvalidPayloadSize)));
    }

    #[test]
    fn rejects_zero_pool_size() {
        let result = ForwarderBuilder::default().with_max_pool_size(0).build();
        assert!(matches!(result, Err(BuildError::InvalidPoolSize)));
    }

    #[test]
    fn rejects_payload_size_too_small_for_telemetry() {
        let result = ForwarderBuilder::default()
            .with_telemetry_flush_interval(Duration::from_secs(10))
            .with_max_payload_size(64)
            .build();

        match result {
            Err(BuildError::TelemetryTooLarge { configured, required }) => {
                assert_eq!(configured, 64);
                assert!(required > 64);
            }
            _ => panic!("expected TelemetryTooLarge"),
        }
    }

    #[test]
    fn telemetry_fits_in_default_payload_size() {
        let forwarder = ForwarderBuilder::default()
            .with_remote_address("127.0.0.1:0")
            .unwrap()
            .with_telemetry_flush_interval(Duration::from_secs(10))
            .build()
            .unwrap();
        forwarder.close();
    }
}
