use uuid::Uuid;

/// Request header carrying the correlation id of one call chain.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Fresh correlation id: 32 lowercase hex characters.
pub fn new_trace_id() -> String {
    Uuid::now_v7().simple().to_string()
}
