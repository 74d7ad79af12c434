//! An asynchronous delivery engine for forwarding pre-encoded [DogStatsD][dsd]-style metric lines to a local
//! collector.
//!
//! [dsd]: https://docs.datadoghq.com/developers/dogstatsd/
//!
//! # Usage
//!
//! Using the forwarder is straightforward:
//!
//! ```no_run
//! # use dogstatsd_forwarder::ForwarderBuilder;
//! // First, create a builder.
//! //
//! // The builder can configure many aspects of the pipeline, such as the remote address, the payload and pool
//! // limits of the buffer, the flush cadence, and the overflow strategy.
//! let forwarder = ForwarderBuilder::default()
//!     .with_remote_address("127.0.0.1:8125")
//!     .expect("failed to parse remote address")
//!     .build()
//!     .expect("failed to build forwarder");
//!
//! // The pipeline is live as soon as `build` returns: hand it encoded metric lines and they are batched and
//! // forwarded in the background, without blocking the caller.
//! forwarder.send("page.views:1|c").expect("pipeline closed");
//!
//! // When a hard delivery point is needed, a synchronous flush blocks until everything accepted so far has been
//! // handed to the socket.
//! forwarder.flush(false, true).expect("pipeline closed");
//!
//! // Closing drains all accepted messages before tearing the pipeline down. Dropping the forwarder does the same.
//! forwarder.close();
//! ```
//!
//! # Features
//!
//! ## Non-blocking send path
//!
//! [`Forwarder::send`] only enqueues: a single background worker thread owns all buffer and socket state and applies
//! queued entries in submission order. Callers never contend on the socket, and the queue is the only structure
//! shared across threads.
//!
//! ## Batching with bounded memory
//!
//! Messages are packed into newline-delimited payloads of at most the configured size, drawn from a fixed pool of
//! reusable regions. When the pool saturates, the configured [`OverflowStrategy`] decides between dropping (counted
//! in telemetry) and surfacing a capacity error.
//!
//! ## Timed and synchronous flushing
//!
//! An optional timer thread flushes the buffer on a monotonic interval. Independently,
//! [`Forwarder::flush`] with `sync` performs a cross-thread rendezvous with the worker, giving a true
//! "delivered to the socket" guarantee without making the send path block.
//!
//! ## Transports
//!
//! Payloads are written over UDP, or over a Unix domain socket in stream mode on Linux. Both are treated as
//! loss-tolerant: write failures are contained, logged, counted, and followed by a transparent reconnect on the next
//! write.
//!
//! ## Telemetry
//!
//! The pipeline tracks its own health: messages, bytes, and packets, sent and dropped. On a configurable interval
//! the counters are encoded as ordinary metric lines and delivered through the same pipeline they measure, under the
//! `datadog.dogstatsd.client` namespace used by official DogStatsD clients.
//!
//! # Missing
//!
//! ## Delivery guarantees
//!
//! The transports may silently drop payloads; nothing here retries or compensates. The submission queue itself is
//! unbounded, so a stalled worker lets it grow without limit.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![deny(missing_docs)]

mod builder;
pub use self::builder::{BuildError, ForwarderBuilder};

mod buffer;
pub use self::buffer::{BufferError, OverflowStrategy};

mod forwarder;
pub use self::forwarder::Forwarder;

mod sender;
pub use self::sender::SenderError;

mod telemetry;
mod transport;
