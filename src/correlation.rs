use uuid::Uuid;

/// Header carrying the per-attempt id on every outgoing request.
pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Generate the identifier attached to one physical request attempt.
///
/// A retried attempt gets a fresh id; the logical operation is correlated
/// by method and path in the logs instead.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
