use thiserror::Error;

/// The error taxonomy of the transport. Structural errors close the
///  connection; handler-level errors are reported in-band with a non-200
///  status and leave the connection open.
#[derive(Debug, Error)]
pub enum CatsError {
    /// Malformed frame, unknown frame type, header length mismatch,
    ///  unexpected input answer, concurrent top-level request, out-of-range
    ///  download speed, oversize frame. Always closes the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake digest mismatch or handshake timeout. Closes the connection.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Invalid data handed to a codec or a header constructor. Handler-level.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// The peer aborted a pending input with a 0x06 frame.
    #[error("input cancelled by peer")]
    InputCancelled,

    /// A pending input was not answered within the input timeout.
    #[error("input timed out")]
    InputTimeout,

    /// No inbound frame within the idle timeout. Closes the connection.
    #[error("connection idled out")]
    IdleTimeout,

    /// The connection was closed while an operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CatsError {
    pub fn protocol(msg: impl Into<String>) -> CatsError {
        CatsError::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> CatsError {
        CatsError::MalformedData(msg.into())
    }

    /// Whether this error terminates the connection (as opposed to being
    ///  reported in-band to the peer).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CatsError::Protocol(_)
                | CatsError::Handshake(_)
                | CatsError::IdleTimeout
                | CatsError::ConnectionClosed
                | CatsError::Io(_)
        )
    }
}
