//! Payload consumers: what the server does with bytes it has read.

use crate::config::ConsumerKind;
use crate::runtime::connection::ConnectionId;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

/// Receives the data of every completed read.
///
/// Called from worker threads, once per read completion with at least
/// one byte. Returning bytes makes the server write them back to the
/// same connection before the connection policy applies.
pub trait PayloadConsumer: Send + Sync {
    fn consume(&self, conn: ConnectionId, data: &[u8]) -> Option<Bytes>;
}

/// Logs what was received.
#[derive(Debug, Default)]
pub struct PrintConsumer;

impl PayloadConsumer for PrintConsumer {
    fn consume(&self, conn: ConnectionId, data: &[u8]) -> Option<Bytes> {
        info!(
            conn_id = conn,
            bytes = data.len(),
            payload = %String::from_utf8_lossy(data),
            "Received"
        );
        None
    }
}

/// Sends every payload straight back.
#[derive(Debug, Default)]
pub struct EchoConsumer;

impl PayloadConsumer for EchoConsumer {
    fn consume(&self, _conn: ConnectionId, data: &[u8]) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(data))
    }
}

/// Build the consumer selected in configuration.
pub fn from_kind(kind: ConsumerKind) -> Arc<dyn PayloadConsumer> {
    match kind {
        ConsumerKind::Print => Arc::new(PrintConsumer),
        ConsumerKind::Echo => Arc::new(EchoConsumer),
    }
}
