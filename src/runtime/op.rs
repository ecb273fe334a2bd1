//! Pending-operation descriptors for completion correlation.
//!
//! Each submitted operation is a boxed `PendingOp` whose address travels
//! through the kernel as the completion's `user_data`. The descriptor owns
//! its connection and its buffer, so correlating a completion is just
//! rebuilding the box, and freeing it is just dropping it.

use crate::runtime::connection::Connection;
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Receive into the descriptor buffer.
    Read,
    /// Send the staged part of the descriptor buffer.
    Write,
}

/// Allocation and free counters for descriptors.
///
/// `outstanding()` returns to zero once every descriptor ever created
/// has been dropped.
#[derive(Debug, Default)]
pub struct OpLedger {
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl OpLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Descriptors created so far.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Descriptors dropped so far.
    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Acquire)
    }

    /// Descriptors currently alive (in flight or held by a worker).
    pub fn outstanding(&self) -> u64 {
        let freed = self.freed();
        self.allocated().saturating_sub(freed)
    }
}

/// One outstanding read or write.
#[derive(Debug)]
pub struct PendingOp {
    kind: OpKind,
    conn: Connection,
    buf: Box<[u8]>,
    /// Bytes received by the last completed read.
    received: usize,
    /// End of the staged write data in `buf`.
    staged: usize,
    /// Start of the not yet written part of the staged data.
    offset: usize,
    /// Reply bytes not yet staged into `buf`.
    outbound: Bytes,
    ledger: Arc<OpLedger>,
}

impl PendingOp {
    /// Create a read descriptor with an empty buffer of `capacity` bytes.
    pub fn read(mut conn: Connection, capacity: usize, ledger: &Arc<OpLedger>) -> Box<Self> {
        conn.start_reading();
        ledger.allocated.fetch_add(1, Ordering::AcqRel);

        Box::new(Self {
            kind: OpKind::Read,
            conn,
            buf: vec![0u8; capacity].into_boxed_slice(),
            received: 0,
            staged: 0,
            offset: 0,
            outbound: Bytes::new(),
            ledger: Arc::clone(ledger),
        })
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Record a completed read of `n` bytes and hand the connection to
    /// the processing stage.
    pub fn complete_read(&mut self, n: usize) -> &[u8] {
        debug_assert_eq!(self.kind, OpKind::Read);
        self.received = n.min(self.buf.len());
        self.conn.start_processing();
        &self.buf[..self.received]
    }

    /// Turn this descriptor back into a read on the same connection.
    pub fn rearm_read(&mut self) {
        self.conn.start_reading();
        self.kind = OpKind::Read;
        self.received = 0;
        self.staged = 0;
        self.offset = 0;
        self.outbound.clear();
    }

    /// Turn this descriptor into a write of `reply`.
    ///
    /// Replies larger than the buffer are sent in buffer-sized chunks.
    pub fn begin_write(&mut self, reply: Bytes) {
        debug_assert!(!reply.is_empty());
        self.conn.start_writing();
        self.kind = OpKind::Write;
        self.outbound = reply;
        self.stage_next();
    }

    /// Account for a write completion of `n` bytes.
    ///
    /// Returns `true` once the whole reply has been written; otherwise
    /// the descriptor is ready to be resubmitted for the remainder.
    pub fn advance_write(&mut self, n: usize) -> bool {
        debug_assert_eq!(self.kind, OpKind::Write);
        self.offset = (self.offset + n).min(self.staged);
        if self.offset < self.staged {
            return false;
        }
        if self.outbound.is_empty() {
            return true;
        }
        self.stage_next();
        false
    }

    /// Bytes still to be written for the current reply.
    pub fn pending_write(&self) -> usize {
        (self.staged - self.offset) + self.outbound.len()
    }

    /// Close the connection and free the descriptor.
    pub fn retire(self: Box<Self>) {
        drop(self);
    }

    fn stage_next(&mut self) {
        let n = self.outbound.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&self.outbound[..n]);
        self.outbound.advance(n);
        self.staged = n;
        self.offset = 0;
    }

    /// Destination for a receive: the whole buffer.
    pub(crate) fn read_target(&mut self) -> (*mut u8, u32) {
        (self.buf.as_mut_ptr(), clamp_len(self.buf.len()))
    }

    /// Source for a send: the staged, unwritten bytes.
    pub(crate) fn write_source(&self) -> (*const u8, u32) {
        let pending = &self.buf[self.offset..self.staged];
        (pending.as_ptr(), clamp_len(pending.len()))
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.ledger.freed.fetch_add(1, Ordering::AcqRel);
    }
}

fn clamp_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
