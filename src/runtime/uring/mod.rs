//! Linux io_uring backend.
//!
//! A single ring is shared by the acceptor (submitting first reads) and
//! every worker (waiting for completions and resubmitting).

pub mod completion;
pub mod event_loop;

pub use completion::{Completion, CompletionQueue};
pub use event_loop::{spawn_workers, WorkerExit};
