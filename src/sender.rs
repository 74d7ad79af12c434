use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender as ChannelSender};
use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error};

use crate::buffer::{BufferError, MessageBuffer};

/// Errors from misusing or failing to run the send pipeline.
#[derive(Debug, Error)]
pub enum SenderError {
    /// An operation other than `start` was invoked before the sender was started.
    #[error("sender not started")]
    NotStarted,

    /// `start` was invoked while the sender was already running.
    #[error("sender already started")]
    AlreadyStarted,

    /// A background thread could not be spawned.
    #[error("failed to spawn background thread for the send pipeline")]
    Backend,
}

/// The buffering seam between the worker loop and the payload packer.
///
/// The worker thread is the only caller, so implementations need no interior synchronization.
pub(crate) trait Buffering: Send + 'static {
    fn add(&mut self, message: &str) -> Result<(), BufferError>;
    fn flush(&mut self);
    fn close(&mut self);
}

impl Buffering for MessageBuffer {
    fn add(&mut self, message: &str) -> Result<(), BufferError> {
        MessageBuffer::add(self, message)
    }

    fn flush(&mut self) {
        MessageBuffer::flush(self);
    }

    fn close(&mut self) {
        MessageBuffer::close(self);
    }
}

/// Submission queue entry, consumed exclusively by the worker loop.
enum Command {
    /// One encoded message to pack into the buffer.
    Message(String),

    /// Flush the buffer to the transport.
    Flush,

    /// Signal the carried reply channel once every earlier entry has been applied.
    Rendezvous(ChannelSender<()>),

    /// Terminate the worker loop.
    Close,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Lifecycle {
    Stopped,
    Running,
    Stopping,
}

/// Lifecycle state shared with the timer thread, which parks on the condvar between flushes.
struct Shared {
    lifecycle: Mutex<Lifecycle>,
    wakeup: Condvar,
}

struct Handles<B> {
    buffer: Option<B>,
    worker: Option<JoinHandle<B>>,
    timer: Option<JoinHandle<()>>,
}

thread_local! {
    // Per-thread reply channel for rendezvous, created lazily and reused across calls.
    static REPLY: (ChannelSender<()>, Receiver<()>) = bounded(1);
}

/// Background worker driving the buffer, plus an optional periodic flush timer.
///
/// All mutable transport/buffer state is owned by a single worker thread; caller threads interact with it only through
/// the submission queue, which is the sole cross-thread ordering authority. `submit` and asynchronous `flush` never
/// block beyond the queue's own internal synchronization; `rendezvous` (and thus `flush(sync: true)`) is the one
/// intentionally blocking operation.
pub(crate) struct Sender<B: Buffering = MessageBuffer> {
    shared: Arc<Shared>,
    queue: RwLock<Option<ChannelSender<Command>>>,
    handles: Mutex<Handles<B>>,
    flush_interval: Option<Duration>,
}

impl<B: Buffering> Sender<B> {
    /// Creates a new `Sender` owning the given buffer.
    ///
    /// When a flush interval is given, a timer thread flushes the buffer periodically once started.
    pub fn new(buffer: B, flush_interval: Option<Duration>) -> Self {
        Sender {
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::Stopped),
                wakeup: Condvar::new(),
            }),
            queue: RwLock::new(None),
            handles: Mutex::new(Handles { buffer: Some(buffer), worker: None, timer: None }),
            flush_interval,
        }
    }

    /// Starts the worker loop, and the timer loop if a flush interval was configured.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the sender is already running, or a backend error if a thread could not be spawned.
    pub fn start(&self) -> Result<(), SenderError> {
        let mut handles = self.handles.lock();

        {
            let lifecycle = self.shared.lifecycle.lock();
            if *lifecycle != Lifecycle::Stopped {
                return Err(SenderError::AlreadyStarted);
            }
        }

        // Recover the buffer from a previous `stop(join_worker: false)` if need be.
        let buffer = match handles.buffer.take() {
            Some(buffer) => buffer,
            None => match handles.worker.take() {
                Some(worker) => worker.join().map_err(|_| SenderError::Backend)?,
                None => return Err(SenderError::Backend),
            },
        };

        let (tx, rx) = unbounded();

        let worker = match thread::Builder::new()
            .name("dogstatsd-forwarder-worker".to_string())
            .spawn(move || worker_loop(buffer, rx))
        {
            Ok(worker) => worker,
            Err(_) => return Err(SenderError::Backend),
        };

        let timer = match self.flush_interval {
            Some(interval) => {
                let shared = Arc::clone(&self.shared);
                let timer_tx = tx.clone();
                let timer = thread::Builder::new()
                    .name("dogstatsd-forwarder-timer".to_string())
                    .spawn(move || timer_loop(&shared, &timer_tx, interval));
                match timer {
                    Ok(timer) => Some(timer),
                    Err(_) => {
                        // Roll back: retire the worker we just spawned.
                        let _ = tx.send(Command::Close);
                        handles.buffer = worker.join().ok();
                        return Err(SenderError::Backend);
                    }
                }
            }
            None => None,
        };

        handles.worker = Some(worker);
        handles.timer = timer;
        *self.queue.write() = Some(tx);
        *self.shared.lifecycle.lock() = Lifecycle::Running;

        Ok(())
    }

    /// Enqueues one message for the worker thread.
    ///
    /// Returns immediately; the message is applied to the buffer asynchronously, in submission order.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the sender is not running.
    pub fn submit(&self, message: String) -> Result<(), SenderError> {
        self.ensure_started()?;

        let queue = self.queue.read();
        let tx = queue.as_ref().ok_or(SenderError::NotStarted)?;
        tx.send(Command::Message(message)).map_err(|_| SenderError::NotStarted)
    }

    /// Enqueues a flush of the buffer.
    ///
    /// With `sync`, additionally performs a [`rendezvous`](Self::rendezvous) before returning, so that every entry
    /// enqueued before this call has been applied to the buffer (and the flush itself performed) once this returns.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the sender is not running.
    pub fn flush(&self, sync: bool) -> Result<(), SenderError> {
        self.ensure_started()?;

        let queue = self.queue.read();
        let tx = queue.as_ref().ok_or(SenderError::NotStarted)?;
        tx.send(Command::Flush).map_err(|_| SenderError::NotStarted)?;

        if sync {
            rendezvous_on(tx);
        }

        Ok(())
    }

    /// Blocks until the worker thread has applied every entry enqueued before this call.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the sender is not running.
    pub fn rendezvous(&self) -> Result<(), SenderError> {
        self.ensure_started()?;

        let queue = self.queue.read();
        let tx = queue.as_ref().ok_or(SenderError::NotStarted)?;
        rendezvous_on(tx);

        Ok(())
    }

    /// Stops the pipeline, draining every entry accepted before this call.
    ///
    /// The timer thread (if any) is woken early, performs one final synchronous flush, and is joined. The worker loop
    /// is then signalled to terminate once the queue is drained; with `join_worker` the worker thread is joined and
    /// its buffer recovered, allowing a later `start`.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the sender is not running.
    pub fn stop(&self, join_worker: bool) -> Result<(), SenderError> {
        let mut handles = self.handles.lock();

        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if *lifecycle != Lifecycle::Running {
                return Err(SenderError::NotStarted);
            }
            *lifecycle = Lifecycle::Stopping;
            self.shared.wakeup.notify_all();
        }

        if let Some(timer) = handles.timer.take() {
            let _ = timer.join();
        }

        *self.shared.lifecycle.lock() = Lifecycle::Stopped;

        // Retiring the queue: anything already enqueued is drained before the sentinel is seen.
        if let Some(tx) = self.queue.write().take() {
            let _ = tx.send(Command::Close);
        }

        if join_worker {
            if let Some(worker) = handles.worker.take() {
                match worker.join() {
                    Ok(buffer) => handles.buffer = Some(buffer),
                    Err(_) => error!("Worker thread panicked during shutdown."),
                }
            }
        }

        Ok(())
    }

    /// Runs a closure against the buffer, if the worker has been stopped and joined.
    pub fn with_buffer<F: FnOnce(&mut B)>(&self, f: F) {
        if let Some(buffer) = self.handles.lock().buffer.as_mut() {
            f(buffer);
        }
    }

    fn ensure_started(&self) -> Result<(), SenderError> {
        // `Stopping` still accepts work: entries submitted while the queue drains land ahead of the close sentinel.
        if *self.shared.lifecycle.lock() == Lifecycle::Stopped {
            return Err(SenderError::NotStarted);
        }
        Ok(())
    }
}

/// Enqueues a rendezvous token carrying this thread's reply channel and blocks until the worker signals it.
fn rendezvous_on(tx: &ChannelSender<Command>) {
    REPLY.with(|(reply_tx, reply_rx)| {
        if tx.send(Command::Rendezvous(reply_tx.clone())).is_ok() {
            let _ = reply_rx.recv();
        }
    });
}

/// Single-consumer dispatch loop.
///
/// Exclusive ownership of the buffer lives here, which is what removes any need for locking around buffer and
/// transport state. Terminates on the close sentinel, after everything enqueued before it has been applied.
fn worker_loop<B: Buffering>(mut buffer: B, rx: Receiver<Command>) -> B {
    for command in rx {
        match command {
            Command::Message(message) => {
                // A capacity error has no synchronous caller to surface to out here, so it is logged and the
                // loop keeps going; the loss is already reflected in the telemetry drop counters.
                if let Err(e) = buffer.add(&message) {
                    error!(error = %e, "Failed to buffer message.");
                }
            }
            Command::Flush => buffer.flush(),
            Command::Rendezvous(reply) => {
                let _ = reply.send(());
            }
            Command::Close => break,
        }
    }

    buffer
}

/// Periodic flush loop.
///
/// Waits out the interval on a monotonic clock, flushing synchronously on every wake. Shutdown wakes the loop early
/// through the condvar; the loop then performs exactly one final synchronous flush before exiting.
fn timer_loop(shared: &Shared, tx: &ChannelSender<Command>, interval: Duration) {
    let mut last_flush = Instant::now();

    loop {
        let stopping = {
            let mut lifecycle = shared.lifecycle.lock();
            if *lifecycle == Lifecycle::Running {
                let timeout = interval.saturating_sub(last_flush.elapsed());
                shared.wakeup.wait_for(&mut lifecycle, timeout);
            }
            *lifecycle != Lifecycle::Running
        };

        last_flush = Instant::now();
        if tx.send(Command::Flush).is_ok() {
            rendezvous_on(tx);
        }

        if stopping {
            debug!("Timer loop flushed one final time, exiting.");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use super::{Buffering, Sender, SenderError};
    use crate::buffer::BufferError;

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum Event {
        Add(String),
        Flush,
        Close,
    }

    #[derive(Clone, Default)]
    struct RecordingBuffer {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl RecordingBuffer {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        fn flush_count(&self) -> usize {
            self.events.lock().iter().filter(|e| **e == Event::Flush).count()
        }
    }

    impl Buffering for RecordingBuffer {
        fn add(&mut self, message: &str) -> Result<(), BufferError> {
            self.events.lock().push(Event::Add(message.to_string()));
            Ok(())
        }

        fn flush(&mut self) {
            self.events.lock().push(Event::Flush);
        }

        fn close(&mut self) {
            self.events.lock().push(Event::Close);
        }
    }

    fn started_sender(flush_interval: Option<Duration>) -> (Sender<RecordingBuffer>, RecordingBuffer) {
        let buffer = RecordingBuffer::default();
        let sender = Sender::new(buffer.clone(), flush_interval);
        sender.start().unwrap();
        (sender, buffer)
    }

    #[test]
    fn operations_before_start_fail() {
        let sender = Sender::new(RecordingBuffer::default(), None);

        assert!(matches!(sender.submit("x:1|c".to_string()), Err(SenderError::NotStarted)));
        assert!(matches!(sender.flush(false), Err(SenderError::NotStarted)));
        assert!(matches!(sender.rendezvous(), Err(SenderError::NotStarted)));
        assert!(matches!(sender.stop(true), Err(SenderError::NotStarted)));
    }

    #[test]
    fn double_start_fails() {
        let (sender, _buffer) = started_sender(None);

        assert!(matches!(sender.start(), Err(SenderError::AlreadyStarted)));

        sender.stop(true).unwrap();
    }

    #[test]
    fn messages_drain_in_order_on_stop() {
        let (sender, buffer) = started_sender(None);

        let messages: Vec<String> = (0..10).map(|i| format!("metric.{i}:1|c")).collect();
        for message in &messages {
            sender.submit(message.clone()).unwrap();
        }
        sender.stop(true).unwrap();

        let expected: Vec<Event> = messages.into_iter().map(Event::Add).collect();
        assert_eq!(buffer.events(), expected);

        assert!(matches!(sender.submit("late:1|c".to_string()), Err(SenderError::NotStarted)));
    }

    #[test]
    fn sync_flush_waits_for_prior_messages() {
        let (sender, buffer) = started_sender(None);

        for i in 0..5 {
            sender.submit(format!("metric.{i}:1|c")).unwrap();
        }
        sender.flush(true).unwrap();

        // Everything submitted before the flush has already been applied, in order, by the time it returns.
        let events = buffer.events();
        assert_eq!(events.len(), 6);
        for (i, event) in events[..5].iter().enumerate() {
            assert_eq!(*event, Event::Add(format!("metric.{i}:1|c")));
        }
        assert_eq!(events[5], Event::Flush);

        sender.stop(true).unwrap();
    }

    #[test]
    fn rendezvous_applies_prior_submissions() {
        let (sender, buffer) = started_sender(None);

        sender.submit("sample:1|c".to_string()).unwrap();
        sender.rendezvous().unwrap();
        assert_eq!(buffer.events(), vec![Event::Add("sample:1|c".to_string())]);

        sender.stop(true).unwrap();
    }

    #[test]
    fn rendezvous_reusable_across_calls() {
        let (sender, buffer) = started_sender(None);

        for i in 0..3 {
            sender.submit(format!("metric.{i}:1|c")).unwrap();
            sender.rendezvous().unwrap();
            assert_eq!(buffer.events().len(), i + 1);
        }

        sender.stop(true).unwrap();
    }

    #[test]
    fn concurrent_producers_all_drain() {
        let (sender, buffer) = started_sender(None);
        let sender = Arc::new(sender);

        let mut producers = Vec::new();
        for t in 0..4 {
            let sender = Arc::clone(&sender);
            producers.push(thread::spawn(move || {
                for i in 0..50 {
                    sender.submit(format!("thread.{t}.metric.{i}:1|c")).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }
        sender.stop(true).unwrap();

        let events = buffer.events();
        assert_eq!(events.len(), 200);

        // FIFO per producer thread.
        for t in 0..4 {
            let prefix = format!("thread.{t}.");
            let order: Vec<&Event> = events
                .iter()
                .filter(|e| matches!(e, Event::Add(m) if m.starts_with(&prefix)))
                .collect();
            assert_eq!(order.len(), 50);
            for (i, event) in order.iter().enumerate() {
                assert_eq!(**event, Event::Add(format!("thread.{t}.metric.{i}:1|c")));
            }
        }
    }

    #[test]
    fn timer_flushes_periodically_and_once_on_stop() {
        let (sender, buffer) = started_sender(Some(Duration::from_millis(25)));

        // Idle pipeline: the timer alone drives flushes.
        let deadline = Instant::now() + Duration::from_secs(5);
        while buffer.flush_count() < 3 {
            assert!(Instant::now() < deadline, "timer never produced 3 flushes");
            thread::sleep(Duration::from_millis(5));
        }

        let before_stop = buffer.flush_count();
        sender.stop(true).unwrap();
        let after_stop = buffer.flush_count();

        // Exactly one final flush from the timer, plus at most one interval tick that raced the stop signal.
        let delta = after_stop - before_stop;
        assert!((1..=2).contains(&delta), "expected 1-2 flushes during stop, saw {delta}");
    }

    #[test]
    fn restart_after_stop() {
        let (sender, buffer) = started_sender(None);

        sender.submit("first:1|c".to_string()).unwrap();
        sender.stop(true).unwrap();

        sender.start().unwrap();
        sender.submit("second:1|c".to_string()).unwrap();
        sender.stop(true).unwrap();

        assert_eq!(
            buffer.events(),
            vec![Event::Add("first:1|c".to_string()), Event::Add("second:1|c".to_string())]
        );
    }

    #[test]
    fn stop_without_joining_worker_still_drains() {
        let (sender, buffer) = started_sender(None);

        sender.submit("metric:1|c".to_string()).unwrap();
        sender.stop(false).unwrap();

        // The worker drains on its own; restarting joins it and recovers the buffer.
        sender.start().unwrap();
        sender.submit("metric:2|c".to_string()).unwrap();
        sender.stop(true).unwrap();

        assert_eq!(
            buffer.events(),
            vec![Event::Add("metric:1|c".to_string()), Event::Add("metric:2|c".to_string())]
        );
    }
}
