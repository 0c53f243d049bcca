//! Structured lifecycle events for batches, entities and the breaker.
//!
//! Every event is a single `info!` (or `warn!`) line carrying an `event`
//! field, so log pipelines can filter on it.

use tracing::{info, warn};

use crate::breaker::CircuitState;

/// RAII guard entering a batch-scoped span.
pub struct BatchSpan {
    _span: tracing::span::EnteredSpan,
}

impl BatchSpan {
    pub fn enter(session_id: &str) -> Self {
        let span = tracing::info_span!("qualifier.batch", session_id = %session_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_batch_started(session_id: &str, entities: usize, concurrency: usize) {
    info!(
        event = "batch.started",
        session_id = %session_id,
        entities = entities,
        concurrency = concurrency,
    );
}

pub fn emit_batch_finished(
    session_id: &str,
    completed: usize,
    aborted: usize,
    cancelled: usize,
    not_admitted: usize,
) {
    info!(
        event = "batch.finished",
        session_id = %session_id,
        completed = completed,
        aborted = aborted,
        cancelled = cancelled,
        not_admitted = not_admitted,
    );
}

pub fn emit_entity_finished(entity_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "entity.finished",
        entity_id = %entity_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_entity_aborted(entity_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "entity.aborted", entity_id = %entity_id, error = %error);
}

pub fn emit_checkpoint_written(session_id: &str, entity_id: &str, stage: &str, seq: u64) {
    info!(
        event = "checkpoint.written",
        session_id = %session_id,
        entity_id = %entity_id,
        stage = %stage,
        seq = seq,
    );
}

pub fn emit_breaker_transition(from: CircuitState, to: CircuitState, consecutive_failures: u32) {
    warn!(
        event = "breaker.transition",
        from = %from,
        to = %to,
        consecutive_failures = consecutive_failures,
    );
}

pub fn emit_session_resumed(session_id: &str, pending: usize, completed: usize) {
    info!(
        event = "session.resumed",
        session_id = %session_id,
        pending = pending,
        completed = completed,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_span_enters() {
        let _span = BatchSpan::enter("session-1");
        emit_batch_started("session-1", 3, 2);
        emit_breaker_transition(CircuitState::Closed, CircuitState::Open, 5);
    }
}
