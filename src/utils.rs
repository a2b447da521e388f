/// Generate a compact session ID (8 hex characters) from the first 4 bytes of a UUID v4.
///
/// Short enough to read in log lines, with ~4 billion values to keep
/// collisions between live sessions unlikely.
pub fn generate_session_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    let bytes = uuid.as_bytes();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// Render bytes as lowercase hex pairs separated by colons (`de:ad:be:ef`).
pub fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
