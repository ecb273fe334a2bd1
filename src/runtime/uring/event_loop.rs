//! Worker pool draining the shared completion queue.
//!
//! Each worker blocks on the queue, takes one completion at a time and
//! runs the per-connection read/write state machine: hand read data to
//! the payload consumer, then write a reply, read again, or close.

use super::completion::{Completion, CompletionQueue};
use crate::config::ConnectionPolicy;
use crate::runtime::op::{OpKind, PendingOp};
use crate::server::ServerContext;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Why a worker thread stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// Observed a shutdown sentinel.
    Sentinel,
    /// Gave up after too many consecutive wait failures.
    WaitFailures(io::Error),
}

/// Spawn `count` workers on the shared context.
///
/// If a spawn fails, the workers already running are stopped before the
/// error is returned.
pub fn spawn_workers(
    ctx: &Arc<ServerContext>,
    count: usize,
) -> io::Result<Vec<JoinHandle<WorkerExit>>> {
    let mut handles = Vec::with_capacity(count);

    for worker_id in 0..count {
        let worker_ctx = Arc::clone(ctx);
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || worker_loop(worker_id, &worker_ctx));

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!(worker = worker_id, error = %e, "Failed to spawn worker");
                ctx.post_sentinels(handles.len());
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(e);
            }
        }
    }

    Ok(handles)
}

fn worker_loop(worker_id: usize, ctx: &ServerContext) -> WorkerExit {
    drive(
        worker_id,
        ctx.max_wait_failures,
        || ctx.queue.wait(),
        |op, result| dispatch(ctx, op, result),
    )
}

/// Pull completions from `next` until a sentinel arrives or
/// `max_failures` waits in a row fail. `EINTR` does not count.
fn drive(
    worker_id: usize,
    max_failures: u32,
    mut next: impl FnMut() -> Completion,
    mut handle: impl FnMut(Box<PendingOp>, i32),
) -> WorkerExit {
    debug!(worker = worker_id, "Worker started");
    let mut failures = 0u32;

    loop {
        match next() {
            Completion::Sentinel => {
                debug!(worker = worker_id, "Worker received sentinel");
                return WorkerExit::Sentinel;
            }
            Completion::WaitFailed(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Completion::WaitFailed(e) => {
                failures += 1;
                warn!(worker = worker_id, error = %e, failures, "Completion wait failed");
                if failures >= max_failures {
                    error!(worker = worker_id, "Too many consecutive wait failures, stopping");
                    return WorkerExit::WaitFailures(e);
                }
            }
            Completion::Op { op, result } => {
                failures = 0;
                handle(op, result);
            }
        }
    }
}

/// Handle one completed operation. Every path either resubmits `op` or
/// retires it.
fn dispatch(ctx: &ServerContext, mut op: Box<PendingOp>, result: i32) {
    let conn_id = op.connection().id();

    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        debug!(conn_id, kind = ?op.kind(), "Operation failed: {}", err);
        op.retire();
        return;
    }

    if result == 0 {
        debug!(
            conn_id,
            peer = %op.connection().peer(),
            kind = ?op.kind(),
            "Connection closed by peer"
        );
        op.retire();
        return;
    }

    let n = result as usize;
    match op.kind() {
        OpKind::Read => {
            trace!(conn_id, bytes = n, capacity = op.capacity(), "Read completed");
            let reply = ctx.consumer.consume(conn_id, op.complete_read(n));
            match reply {
                Some(reply) if !reply.is_empty() => {
                    op.begin_write(reply);
                    submit_or_retire(&ctx.queue, op);
                }
                _ => finish_cycle(ctx, op),
            }
        }
        OpKind::Write => {
            if op.advance_write(n) {
                finish_cycle(ctx, op);
            } else {
                debug!(conn_id, remaining = op.pending_write(), "Partial write");
                submit_or_retire(&ctx.queue, op);
            }
        }
    }
}

/// A read/response cycle is over: close or read again per policy.
fn finish_cycle(ctx: &ServerContext, mut op: Box<PendingOp>) {
    match ctx.policy {
        ConnectionPolicy::Close => op.retire(),
        ConnectionPolicy::KeepAlive => {
            op.rearm_read();
            submit_or_retire(&ctx.queue, op);
        }
    }
}

/// Submit `op`, closing its connection and freeing it if the kernel
/// refuses the submission.
pub(crate) fn submit_or_retire(queue: &CompletionQueue, op: Box<PendingOp>) {
    if let Err(e) = queue.submit(op) {
        warn!("{}", e);
        e.op.retire();
    }
}

/// Log how a joined worker ended; returns whether it saw a sentinel.
pub(crate) fn report_exit(worker_id: usize, exit: thread::Result<WorkerExit>) -> bool {
    match exit {
        Ok(WorkerExit::Sentinel) => {
            info!(worker = worker_id, "Worker stopped");
            true
        }
        Ok(WorkerExit::WaitFailures(e)) => {
            warn!(worker = worker_id, error = %e, "Worker had already stopped");
            false
        }
        Err(_) => {
            error!(worker = worker_id, "Worker panicked");
            false
        }
    }
}
