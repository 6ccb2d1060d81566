//! Outgoing message pool
//!
//! Protocols write into pooled [`OutputMessage`]s. A message either goes out
//! explicitly through [`OutputMessagePool::send`] or, in auto-send mode, is
//! flushed at the end of a dispatcher frame once it is big or old enough.
//! Buffers are recycled; their release always happens on the dispatcher
//! thread.

use crate::connection::Connection;
use crate::dispatcher::{Dispatcher, FrameHook};
use crate::lifetime::Ref;
use crate::protocol::Protocol;
use crate::scheduler::Scheduler;
use crate::tasks::Task;
use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use shared::{FrameOptions, OutputBuffer, WireError};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Auto-send messages still queued after this long are discarded
pub const STALE_MESSAGE_AGE: Duration = Duration::from_secs(10);
/// Auto-send messages larger than this are flushed at the end of the frame
pub const AUTO_SEND_SIZE: usize = 1024;
/// Auto-send messages at least this old are flushed regardless of size
pub const AUTO_SEND_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Allocated,
    AllocatedNoAutoSend,
}

pub type OutputMessagePtr = Arc<OutputMessage>;

/// References that keep the destination alive while the message exists
struct Owner {
    protocol: Ref<dyn Protocol>,
    connection: Ref<Connection>,
}

pub struct OutputMessage {
    buffer: Mutex<Option<OutputBuffer>>,
    owner: Mutex<Option<Owner>>,
    state: MessageState,
    frame: Instant,
    sealed: AtomicBool,
    pool: Weak<OutputMessagePool>,
}

impl OutputMessage {
    /// Locks the body for writing
    pub fn buffer(&self) -> MappedMutexGuard<'_, OutputBuffer> {
        MutexGuard::map(self.buffer.lock(), |slot| {
            slot.get_or_insert_with(OutputBuffer::new)
        })
    }

    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Frame timestamp the message was created in
    pub fn frame(&self) -> Instant {
        self.frame
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.owner
            .lock()
            .as_ref()
            .map(|owner| Arc::clone(owner.protocol.arc()))
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.owner
            .lock()
            .as_ref()
            .map(|owner| Arc::clone(owner.connection.arc()))
    }

    /// Applies framing once; later calls are no-ops
    pub(crate) fn seal(&self, options: &FrameOptions) -> Result<(), WireError> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut buffer = self.buffer();
        shared::seal(&mut buffer, options)
    }

    /// Copy of the bytes that go on the wire
    pub fn frame_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.buffer().body())
    }
}

impl Drop for OutputMessage {
    fn drop(&mut self) {
        let buffer = self.buffer.get_mut().take();
        let owner = self.owner.get_mut().take();
        if let Some(pool) = self.pool.upgrade() {
            pool.release_message(buffer, owner);
        }
    }
}

/// Snapshot of pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers ever created and not yet discarded
    pub allocated: usize,
    pub free: usize,
    pub queued: usize,
    pub auto_send: usize,
    /// Messages handed out and not yet released, queued ones included
    pub checked_out: usize,
}

impl PoolStats {
    pub fn is_consistent(&self) -> bool {
        self.allocated == self.free + self.checked_out
            && self.queued + self.auto_send <= self.checked_out
    }
}

struct PoolInner {
    free: Vec<OutputBuffer>,
    add_queue: Vec<OutputMessagePtr>,
    auto_send: Vec<OutputMessagePtr>,
    allocated: usize,
    checked_out: usize,
    open: bool,
}

pub struct OutputMessagePool {
    inner: Mutex<PoolInner>,
    frame_time: Mutex<Instant>,
    flush_scheduled: AtomicBool,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    me: Weak<OutputMessagePool>,
}

impl OutputMessagePool {
    pub fn new(dispatcher: Arc<Dispatcher>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                add_queue: Vec::new(),
                auto_send: Vec::new(),
                allocated: 0,
                checked_out: 0,
                open: true,
            }),
            frame_time: Mutex::new(Instant::now()),
            flush_scheduled: AtomicBool::new(false),
            dispatcher,
            scheduler,
            me: me.clone(),
        })
    }

    /// Hands out an empty message bound to `protocol` and its connection
    ///
    /// Returns `None` once the pool is shut down, or when the protocol has no
    /// live connection left.
    pub fn get_output_message(
        &self,
        protocol: &Arc<dyn Protocol>,
        auto_send: bool,
    ) -> Option<OutputMessagePtr> {
        let connection = protocol.core().connection()?;
        let protocol_ref = Ref::acquire(Arc::clone(protocol))?;
        let connection_ref = Ref::acquire(connection)?;

        let frame = if self.dispatcher.is_dispatcher_thread() {
            *self.frame_time.lock()
        } else {
            Instant::now()
        };

        let mut inner = self.inner.lock();
        if !inner.open {
            drop(inner);
            return None;
        }
        let mut buffer = match inner.free.pop() {
            Some(buffer) => buffer,
            None => {
                inner.allocated += 1;
                OutputBuffer::new()
            }
        };
        buffer.reset();
        inner.checked_out += 1;

        let message = Arc::new(OutputMessage {
            buffer: Mutex::new(Some(buffer)),
            owner: Mutex::new(Some(Owner {
                protocol: protocol_ref,
                connection: connection_ref,
            })),
            state: if auto_send {
                MessageState::Allocated
            } else {
                MessageState::AllocatedNoAutoSend
            },
            frame,
            sealed: AtomicBool::new(false),
            pool: self.me.clone(),
        });

        if auto_send {
            inner.add_queue.push(Arc::clone(&message));
        }
        Some(message)
    }

    /// Sends a message that was requested without auto-send
    pub fn send(&self, message: OutputMessagePtr) {
        if message.state() != MessageState::AllocatedNoAutoSend {
            warn!("Explicit send of an auto-send message ignored");
            return;
        }
        match message.connection() {
            Some(connection) => {
                connection.send(message);
            }
            None => debug!("Dropping message for released connection"),
        }
    }

    /// Defers a message to the next frame flush
    pub fn auto_send(&self, message: OutputMessagePtr) {
        let mut inner = self.inner.lock();
        if !inner.open {
            drop(inner);
            drop(message);
            return;
        }
        inner.auto_send.push(message);
        drop(inner);
        self.schedule_flush();
    }

    pub fn start_execution_frame(&self) {
        *self.frame_time.lock() = Instant::now();
    }

    /// Flushes the auto-send queues; runs at the end of every dispatcher frame
    pub fn send_all(&self) {
        self.send_all_at(Instant::now());
    }

    pub fn send_all_at(&self, now: Instant) {
        let pending = {
            let mut inner = self.inner.lock();
            let mut pending = mem::take(&mut inner.auto_send);
            pending.append(&mut inner.add_queue);
            pending
        };
        if pending.is_empty() {
            return;
        }

        let mut keep = Vec::new();
        let mut stale = Vec::new();
        let mut ready = Vec::new();
        for message in pending {
            let age = now.saturating_duration_since(message.frame());
            let len = message.len();
            if age > STALE_MESSAGE_AGE {
                stale.push(message);
            } else if len > 0 && (len > AUTO_SEND_SIZE || age >= AUTO_SEND_DELAY) {
                ready.push(message);
            } else {
                keep.push(message);
            }
        }

        let needs_flush = keep.iter().any(|message| !message.is_empty());
        let discarded = {
            let mut inner = self.inner.lock();
            if inner.open {
                keep.append(&mut inner.auto_send);
                inner.auto_send = keep;
                Vec::new()
            } else {
                keep
            }
        };
        drop(discarded);

        for message in stale {
            warn!(
                "Discarding auto-send message queued for {:?} ({} bytes)",
                now.saturating_duration_since(message.frame()),
                message.len()
            );
            if let Some(protocol) = message.protocol() {
                protocol.on_send_message(&message);
            }
        }

        for message in ready {
            match message.connection() {
                Some(connection) => {
                    connection.send(message);
                }
                None => trace!("Auto-send message lost its connection"),
            }
        }

        if needs_flush {
            self.schedule_flush();
        }
    }

    /// Stops handing out messages and drops everything still queued
    pub fn shutdown(&self) {
        let (queued, auto) = {
            let mut inner = self.inner.lock();
            inner.open = false;
            (
                mem::take(&mut inner.add_queue),
                mem::take(&mut inner.auto_send),
            )
        };
        debug!(
            "Output pool shut down, dropping {} queued message(s)",
            queued.len() + auto.len()
        );
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            allocated: inner.allocated,
            free: inner.free.len(),
            queued: inner.add_queue.len(),
            auto_send: inner.auto_send.len(),
            checked_out: inner.checked_out,
        }
    }

    fn release_message(&self, buffer: Option<OutputBuffer>, owner: Option<Owner>) {
        if self.dispatcher.is_dispatcher_thread() {
            self.internal_release(buffer, owner);
            return;
        }

        let pool = self.me.clone();
        let task = Task::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.internal_release(buffer, owner);
            }
        });
        if let Err(task) = self.dispatcher.try_add_task(task, false) {
            task.execute();
        }
    }

    fn internal_release(&self, buffer: Option<OutputBuffer>, owner: Option<Owner>) {
        // Teardown triggered by the last ref takes other locks.
        drop(owner);

        let mut inner = self.inner.lock();
        inner.checked_out = inner.checked_out.saturating_sub(1);
        match buffer {
            Some(mut buffer) => {
                buffer.reset();
                inner.free.push(buffer);
            }
            None => inner.allocated = inner.allocated.saturating_sub(1),
        }
    }

    fn schedule_flush(&self) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.me.clone();
        // The task body is empty: the dispatcher's end-of-frame hook does the flush.
        let id = self.scheduler.schedule(AUTO_SEND_DELAY, move || {
            if let Some(pool) = pool.upgrade() {
                pool.flush_scheduled.store(false, Ordering::SeqCst);
            }
        });
        if id == 0 {
            self.flush_scheduled.store(false, Ordering::SeqCst);
        }
    }
}

impl FrameHook for OutputMessagePool {
    fn begin_frame(&self) {
        self.start_execution_frame();
    }

    fn end_frame(&self) {
        self.send_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, RecordingProtocol};

    fn setup() -> (
        Arc<crate::context::ServerContext>,
        Arc<Connection>,
        Arc<RecordingProtocol>,
        Arc<dyn Protocol>,
    ) {
        let context = testing::context();
        let connection = testing::connection(&context);
        let recording = RecordingProtocol::attach(&connection);
        let protocol: Arc<dyn Protocol> = recording.clone();
        (context, connection, recording, protocol)
    }

    #[test]
    fn test_stale_message_is_discarded_and_protocol_notified() {
        let (context, connection, recording, protocol) = setup();
        let pool = &context.pool;

        let message = pool.get_output_message(&protocol, true).unwrap();
        message.buffer().add_u8(0x1E).unwrap();
        let frame = message.frame();
        drop(message);

        pool.send_all_at(frame + Duration::from_secs(11));

        assert_eq!(recording.sent(), 1);
        assert!(connection.take_written().is_empty());
        let stats = pool.stats();
        assert_eq!(stats.auto_send, 0);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.free, 1);
    }

    #[test]
    fn test_large_message_flushes_immediately() {
        let (context, connection, recording, protocol) = setup();
        let pool = &context.pool;

        let message = pool.get_output_message(&protocol, true).unwrap();
        message.buffer().add_bytes(&[7; AUTO_SEND_SIZE + 1]).unwrap();
        let frame = message.frame();
        drop(message);

        pool.send_all_at(frame);

        let written = connection.take_written();
        assert_eq!(written.len(), 1);
        assert!(written[0].is_sealed());
        assert_eq!(recording.sent(), 1);
    }

    #[test]
    fn test_small_message_waits_for_delay() {
        let (context, connection, _recording, protocol) = setup();
        let pool = &context.pool;

        let message = pool.get_output_message(&protocol, true).unwrap();
        message.buffer().add_bytes(b"abc").unwrap();
        let frame = message.frame();
        drop(message);

        pool.send_all_at(frame);
        assert!(connection.take_written().is_empty());
        assert_eq!(pool.stats().auto_send, 1);

        pool.send_all_at(frame + Duration::from_millis(20));
        assert_eq!(connection.take_written().len(), 1);
        assert_eq!(pool.stats().auto_send, 0);
    }

    #[test]
    fn test_empty_auto_send_message_stays_queued() {
        let (context, connection, _recording, protocol) = setup();
        let pool = &context.pool;

        let message = pool.get_output_message(&protocol, true).unwrap();
        let frame = message.frame();
        drop(message);

        pool.send_all_at(frame + Duration::from_secs(1));
        assert!(connection.take_written().is_empty());
        assert_eq!(pool.stats().auto_send, 1);
    }

    #[test]
    fn test_busy_connection_defers_to_auto_send() {
        let (context, connection, recording, protocol) = setup();
        let pool = &context.pool;

        let first = pool.get_output_message(&protocol, false).unwrap();
        first.buffer().add_u8(1).unwrap();
        pool.send(first);
        assert_eq!(connection.pending_writes(), 1);

        let second = pool.get_output_message(&protocol, false).unwrap();
        second.buffer().add_u8(2).unwrap();
        let frame = second.frame();
        pool.send(second);
        assert_eq!(pool.stats().auto_send, 1);
        assert_eq!(recording.sent(), 1);

        assert_eq!(connection.take_written().len(), 1);
        connection.complete_write();
        pool.send_all_at(frame + AUTO_SEND_DELAY);

        assert_eq!(connection.take_written().len(), 1);
        assert_eq!(recording.sent(), 2);
    }

    #[test]
    fn test_pool_bookkeeping_stays_consistent() {
        let (context, connection, _recording, protocol) = setup();
        let pool = &context.pool;

        let a = pool.get_output_message(&protocol, true).unwrap();
        let b = pool.get_output_message(&protocol, false).unwrap();
        let c = pool.get_output_message(&protocol, true).unwrap();
        let stats = pool.stats();
        assert!(stats.is_consistent());
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.queued, 2);

        a.buffer().add_u8(1).unwrap();
        let frame = a.frame();
        drop((a, b, c));
        assert!(pool.stats().is_consistent());

        pool.send_all_at(frame + AUTO_SEND_DELAY);
        assert!(pool.stats().is_consistent());
        drop(connection.take_written());

        let reused = pool.get_output_message(&protocol, false).unwrap();
        assert!(reused.is_empty());
        let stats = pool.stats();
        assert!(stats.is_consistent());
        assert_eq!(stats.allocated, 3);
    }

    #[test]
    fn test_shutdown_refuses_new_messages() {
        let (context, _connection, _recording, protocol) = setup();
        let pool = &context.pool;

        let queued = pool.get_output_message(&protocol, true).unwrap();
        drop(queued);
        pool.shutdown();

        assert!(!pool.is_open());
        assert!(pool.get_output_message(&protocol, true).is_none());
        let stats = pool.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.checked_out, 0);
    }

    #[test]
    fn test_no_message_without_connection() {
        let (context, connection, _recording, protocol) = setup();
        connection.close();

        assert!(context.pool.get_output_message(&protocol, true).is_none());
    }
}
