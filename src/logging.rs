//! Ambient traffic/diagnostic logging, backed by `tracing`.

use std::fmt;

use crate::chunk::Chunk;

/// Hooks an embedder can implement to observe protocol traffic and
/// diagnostics without the crate committing to a specific logging
/// backend.
pub trait TrafficLogger: Send + Sync {
    fn sent_chunk(&self, chunk: &Chunk) {
        let _ = chunk;
    }

    fn received_chunk(&self, chunk: &Chunk) {
        let _ = chunk;
    }

    /// A byte run the framer discarded: a malformed first line, an
    /// unterminated header, or a chunk over a size cap.
    fn received_illegal_data(&self, data: &[u8]) {
        let _ = data;
    }

    fn debug(&self, message: fmt::Arguments) {
        let _ = message;
    }

    fn info(&self, message: fmt::Arguments) {
        let _ = message;
    }

    fn error(&self, message: fmt::Arguments) {
        let _ = message;
    }
}

/// Forwards every hook to `tracing`, the default for an embedder that
/// hasn't supplied its own [`TrafficLogger`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTrafficLogger;

impl TrafficLogger for TracingTrafficLogger {
    fn sent_chunk(&self, chunk: &Chunk) {
        tracing::debug!(transaction_id = chunk.transaction_id(), "sent chunk");
    }

    fn received_chunk(&self, chunk: &Chunk) {
        tracing::debug!(transaction_id = chunk.transaction_id(), "received chunk");
    }

    fn received_illegal_data(&self, data: &[u8]) {
        tracing::warn!(bytes = data.len(), "discarded illegal data on the wire");
    }

    fn debug(&self, message: fmt::Arguments) {
        tracing::debug!("{}", message);
    }

    fn info(&self, message: fmt::Arguments) {
        tracing::info!("{}", message);
    }

    fn error(&self, message: fmt::Arguments) {
        tracing::error!("{}", message);
    }
}

/// Discards everything; useful in tests where traffic noise isn't wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl TrafficLogger for NoopLogger {}
