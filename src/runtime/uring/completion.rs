//! Completion queue shared by the acceptor and every worker.
//!
//! One io_uring instance plays the role of the completion port. Any thread
//! may submit; any worker may wait. Descriptor ownership travels as the
//! `user_data` pointer: `submit` leaks the box into the kernel and `wait`
//! rebuilds it, so a descriptor is owned by exactly one side at a time.

use crate::runtime::op::{OpKind, PendingOp};
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::{Mutex, MutexGuard};
use tracing::{trace, warn};

/// `user_data` of a sentinel: no descriptor.
const SENTINEL: u64 = 0;

/// One dequeued notification.
#[derive(Debug)]
pub enum Completion {
    /// A submitted operation finished. `result` is the transfer count, or a
    /// negated errno.
    Op { op: Box<PendingOp>, result: i32 },
    /// A shutdown sentinel.
    Sentinel,
    /// The wait itself failed without yielding a completion.
    WaitFailed(io::Error),
}

/// Submission that the kernel never saw. The descriptor comes back to the
/// caller, who must close and free it.
#[derive(Debug)]
pub struct SubmitError {
    pub op: Box<PendingOp>,
    pub error: io::Error,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to submit {:?} on connection {}: {}",
            self.op.kind(),
            self.op.connection().id(),
            self.error
        )
    }
}

impl std::error::Error for SubmitError {}

pub struct CompletionQueue {
    ring: IoUring,
    /// Serializes pushes into the submission queue.
    sq_lock: Mutex<()>,
    /// Serializes pops from the completion queue.
    cq_lock: Mutex<()>,
}

impl CompletionQueue {
    /// Create a completion queue with `entries` submission slots.
    pub fn new(entries: u32) -> io::Result<Self> {
        let entries = entries.checked_next_power_of_two().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "ring size too large")
        })?;
        let ring = IoUring::builder().build(entries)?;
        Ok(Self {
            ring,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
        })
    }

    /// Hand `op` to the kernel.
    ///
    /// On success the descriptor belongs to the kernel until a worker
    /// dequeues its completion. On failure it is returned untouched.
    pub fn submit(&self, mut op: Box<PendingOp>) -> Result<(), SubmitError> {
        let fd = types::Fd(op.connection().as_raw_fd());
        let entry = match op.kind() {
            OpKind::Read => {
                let (buf, len) = op.read_target();
                opcode::Recv::new(fd, buf, len).build()
            }
            OpKind::Write => {
                let (buf, len) = op.write_source();
                opcode::Send::new(fd, buf, len).build()
            }
        };

        let raw = Box::into_raw(op);
        let entry = entry.user_data(raw as u64);

        // SAFETY: the buffer referenced by the entry lives inside the leaked
        // box, which is only rebuilt when its completion is dequeued.
        if let Err(error) = unsafe { self.push(&entry) } {
            // SAFETY: the kernel never saw the entry, so we still own the box.
            let op = unsafe { Box::from_raw(raw) };
            return Err(SubmitError { op, error });
        }

        self.flush();
        Ok(())
    }

    /// Post one sentinel: a no-op with no descriptor and a zero transfer count.
    pub fn post_sentinel(&self) -> io::Result<()> {
        let entry = opcode::Nop::new().build().user_data(SENTINEL);
        // SAFETY: a no-op references no memory.
        unsafe { self.push(&entry)? };
        self.flush();
        Ok(())
    }

    /// Block until one completion is available and take it.
    pub fn wait(&self) -> Completion {
        loop {
            if let Some(completion) = self.try_next() {
                return completion;
            }

            // Several workers may wake for one entry; losers go back to sleep.
            if let Err(e) = self.ring.submit_and_wait(1) {
                return Completion::WaitFailed(e);
            }
        }
    }

    /// Take one completion if any is ready, without blocking.
    pub fn try_next(&self) -> Option<Completion> {
        loop {
            let (user_data, result) = {
                let _guard = lock(&self.cq_lock);
                // SAFETY: `cq_lock` makes this the only live completion queue view.
                let mut cq = unsafe { self.ring.completion_shared() };
                let cqe = cq.next()?;
                (cqe.user_data(), cqe.result())
            };

            if user_data == SENTINEL {
                if result == 0 {
                    return Some(Completion::Sentinel);
                }
                warn!(result, "Ignoring completion without descriptor");
                continue;
            }

            // SAFETY: every non-sentinel user_data came from `Box::into_raw` in
            // `submit`, and each completion is popped exactly once.
            let op = unsafe { Box::from_raw(user_data as *mut PendingOp) };
            trace!(conn_id = op.connection().id(), kind = ?op.kind(), result, "Completion");
            return Some(Completion::Op { op, result });
        }
    }

    /// Push queued submissions to the kernel without waiting.
    ///
    /// A failed flush leaves entries queued; the next wait submits them.
    pub fn flush(&self) {
        if let Err(e) = self.ring.submit() {
            warn!(error = %e, "Submission flush failed");
        }
    }

    /// # Safety
    /// Memory referenced by `entry` must stay valid until its completion.
    unsafe fn push(&self, entry: &squeue::Entry) -> io::Result<()> {
        let _guard = lock(&self.sq_lock);

        if self.try_push(entry) {
            return Ok(());
        }

        // Queue full: hand what is there to the kernel and retry once.
        self.ring.submit()?;
        if self.try_push(entry) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "submission queue full",
            ))
        }
    }

    /// Caller must hold `sq_lock`.
    unsafe fn try_push(&self, entry: &squeue::Entry) -> bool {
        let mut sq = self.ring.submission_shared();
        sq.push(entry).is_ok()
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::tests::stream_pair;
    use crate::runtime::connection::ConnectionRegistry;
    use crate::runtime::op::OpLedger;
    use crate::runtime::uring::event_loop::submit_or_retire;
    use bytes::Bytes;
    use socket2::SockRef;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    /// io_uring may be disabled by the kernel or a seccomp profile.
    fn queue_or_skip(entries: u32) -> Option<CompletionQueue> {
        match CompletionQueue::new(entries) {
            Ok(queue) => Some(queue),
            Err(e) => {
                eprintln!("io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    /// A ring created disabled rejects `io_uring_enter`, so once its single
    /// submission slot is taken no further entry can be pushed.
    fn disabled_queue_or_skip() -> Option<CompletionQueue> {
        match IoUring::builder().setup_r_disabled().build(1) {
            Ok(ring) => Some(CompletionQueue {
                ring,
                sq_lock: Mutex::new(()),
                cq_lock: Mutex::new(()),
            }),
            Err(e) => {
                eprintln!("disabled io_uring unavailable, skipping: {}", e);
                None
            }
        }
    }

    fn expect_op(completion: Completion) -> (Box<PendingOp>, i32) {
        match completion {
            Completion::Op { op, result } => (op, result),
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[test]
    fn test_one_sentinel_per_wait() {
        let Some(queue) = queue_or_skip(8) else { return };

        for _ in 0..3 {
            queue.post_sentinel().unwrap();
        }
        for _ in 0..3 {
            assert!(matches!(queue.wait(), Completion::Sentinel));
        }
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_read_completion_returns_descriptor() {
        let Some(queue) = queue_or_skip(8) else { return };
        let ledger = OpLedger::new();
        let registry = ConnectionRegistry::new(4);
        let (server, peer, mut client) = stream_pair();
        let conn = registry.register(server, peer).unwrap();

        queue.submit(PendingOp::read(conn, 64, &ledger)).unwrap();
        client.write_all(b"abc").unwrap();

        let (mut op, result) = expect_op(queue.wait());
        assert_eq!(result, 3);
        assert_eq!(op.complete_read(result as usize), b"abc");

        op.begin_write(Bytes::from_static(b"xyz"));
        queue.submit(op).unwrap();
        let (mut op, result) = expect_op(queue.wait());
        assert_eq!(result, 3);
        assert!(op.advance_write(result as usize));

        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"xyz");

        op.retire();
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_peer_close_completes_with_zero() {
        let Some(queue) = queue_or_skip(8) else { return };
        let ledger = OpLedger::new();
        let registry = ConnectionRegistry::new(4);
        let (server, peer, client) = stream_pair();
        let conn = registry.register(server, peer).unwrap();

        queue.submit(PendingOp::read(conn, 64, &ledger)).unwrap();
        drop(client);

        let (op, result) = expect_op(queue.wait());
        assert_eq!(result, 0);
        op.retire();
        assert_eq!(ledger.outstanding(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reset_completes_with_error() {
        let Some(queue) = queue_or_skip(8) else { return };
        let ledger = OpLedger::new();
        let registry = ConnectionRegistry::new(4);
        let (server, peer, client) = stream_pair();
        let conn = registry.register(server, peer).unwrap();

        queue.submit(PendingOp::read(conn, 64, &ledger)).unwrap();
        SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        let (op, result) = expect_op(queue.wait());
        assert_eq!(result, -libc::ECONNRESET);
        op.retire();
        assert_eq!(ledger.allocated(), 1);
        assert_eq!(ledger.freed(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_refused_submission_hands_descriptor_back() {
        let Some(queue) = disabled_queue_or_skip() else { return };
        let ledger = OpLedger::new();
        let registry = ConnectionRegistry::new(4);
        let (server, peer, mut client) = stream_pair();
        let conn = registry.register(server, peer).unwrap();

        // Takes the only slot; the flush fails and the entry stays queued.
        queue.post_sentinel().unwrap();

        let refused = queue.submit(PendingOp::read(conn, 64, &ledger)).unwrap_err();
        assert_eq!(refused.op.kind(), OpKind::Read);
        assert_eq!(ledger.outstanding(), 1);
        assert_eq!(registry.len(), 1);

        submit_or_retire(&queue, refused.op);
        assert_eq!(ledger.allocated(), 1);
        assert_eq!(ledger.freed(), 1);
        assert!(registry.is_empty());

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_oversized_ring_is_rejected() {
        let err = CompletionQueue::new(u32::MAX).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_waiters_on_many_threads_each_take_one() {
        let Some(queue) = queue_or_skip(16) else { return };
        let queue = Arc::new(queue);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || matches!(queue.wait(), Completion::Sentinel))
            })
            .collect();

        for _ in 0..4 {
            queue.post_sentinel().unwrap();
        }
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
