//! CorrelationIdResolver - 受信した correlation id の解釈と修復

use tracing::warn;

use crate::domain::CorrelationId;

/// Parse the inbound correlation id. Anything that is not a UUID (a missing
/// value included) is replaced with a fresh id and reported once.
pub fn resolve_correlation_id(raw: Option<&str>) -> CorrelationId {
    if let Some(id) = raw.and_then(CorrelationId::parse) {
        return id;
    }

    let correlation_id = CorrelationId::new();
    warn!(
        invalid_correlation_id = raw.unwrap_or(""),
        %correlation_id,
        "CorrelationId: {} is not a recognized GUID format. Created new id: {}",
        raw.unwrap_or(""),
        correlation_id,
    );
    correlation_id
}
