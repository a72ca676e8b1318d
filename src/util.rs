use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch, UTC. This is the timestamp format used
///  everywhere on the wire (connect reply, `send_time` fields, ping payloads).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_millis() as u64
}

/// Seconds since the UNIX epoch, UTC. Used by the time-bucket handshake.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_secs()
}
