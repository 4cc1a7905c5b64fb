use std::time::SystemTime;

/// Generate a Unix timestamp in Millis.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Abbreviated node id for display.
pub fn short_id(node_id: &iroh::NodeId) -> String {
    node_id.fmt_short()
}
