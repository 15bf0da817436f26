use thiserror::Error;

/// Main error type for rudpmesh operations
#[derive(Error, Debug)]
pub enum RudpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Duplicate sequence {sequence} inserted into a sequence queue")]
    DuplicateSequence { sequence: u32 },

    #[error("Local sequence {sequence} reused before the previous packet aged out")]
    SequenceReuse { sequence: u32 },

    #[error("Queue {queue} lost its sequence ordering")]
    UnsortedQueue { queue: &'static str },

    #[error("Protocol id mismatch: received {actual:#010x}, expected {expected:#010x}")]
    ProtocolMismatch { expected: u32, actual: u32 },

    #[error("Packet too small: {size} bytes (min: {min})")]
    PacketTooSmall { size: usize, min: usize },

    #[error("Buffer too large: {size} bytes (max: {max})")]
    BufferTooLarge { size: usize, max: usize },

    #[error("Topology is not running")]
    NotRunning,

    #[error("Node {node_id} is not a connected node")]
    InvalidNode { node_id: usize },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Error severity levels for handling different types of errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorSeverity {
    /// Channel or caller conditions; the link keeps working
    Recoverable,
    /// Protocol logic defects; the link state can no longer be trusted
    Critical,
}

impl RudpError {
    /// Get the severity level of this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RudpError::Io(_) => ErrorSeverity::Recoverable,
            RudpError::Protocol { .. } => ErrorSeverity::Critical,
            RudpError::DuplicateSequence { .. } => ErrorSeverity::Critical,
            RudpError::SequenceReuse { .. } => ErrorSeverity::Critical,
            RudpError::UnsortedQueue { .. } => ErrorSeverity::Critical,
            RudpError::ProtocolMismatch { .. } => ErrorSeverity::Recoverable,
            RudpError::PacketTooSmall { .. } => ErrorSeverity::Recoverable,
            RudpError::BufferTooLarge { .. } => ErrorSeverity::Recoverable,
            RudpError::NotRunning => ErrorSeverity::Recoverable,
            RudpError::InvalidNode { .. } => ErrorSeverity::Recoverable,
            RudpError::Config { .. } => ErrorSeverity::Recoverable,
        }
    }
}
