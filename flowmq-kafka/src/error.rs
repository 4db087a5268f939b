use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Send Error - {0}")]
    Send(#[from] SendError),

    #[error("Record Error - {0}")]
    Record(String),

    #[error("Transaction Error - {0}")]
    Transaction(String),

    #[error(
        "Rebalance on channel {channel} - consumer group generation changed from {expected} to {live}"
    )]
    Rebalance {
        channel: String,
        expected: i32,
        live: i32,
    },

    #[error("Transaction already in progress on channel {0}")]
    TransactionInProgress(String),

    #[error("No consumer bound to channel {0}")]
    NoConsumerForChannel(String),

    #[error("Exactly-once processing requires a single consumer on channel {0}, found {1}")]
    MultipleConsumersForChannel(String, usize),

    #[error("No record metadata found on message for channel lookup")]
    NoRecordMetadata,

    #[error("Cancelled - {0}")]
    Cancelled(String),

    #[error("Health Error - {0}")]
    Health(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorTaskTerminated(String),
}

/// A failed produce attempt, carrying the broker-side classification that
/// decides whether the send may be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} - {message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::new(SendErrorKind::Other, message)
    }

    /// Everything outside the fixed fatal set may be retried.
    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }
}

/// Failure classification for sends. The fatal set mirrors the broker
/// client's produce callback contract; everything else is transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    InvalidTopic,
    OffsetMetadataTooLarge,
    RecordBatchTooLarge,
    RecordTooLarge,
    UnknownServer,
    Serialization,
    TransactionAborted,
    /// Any other failure; retryable.
    Other,
}

impl SendErrorKind {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SendErrorKind::Other)
    }

    fn as_str(&self) -> &'static str {
        match self {
            SendErrorKind::InvalidTopic => "InvalidTopic",
            SendErrorKind::OffsetMetadataTooLarge => "OffsetMetadataTooLarge",
            SendErrorKind::RecordBatchTooLarge => "RecordBatchTooLarge",
            SendErrorKind::RecordTooLarge => "RecordTooLarge",
            SendErrorKind::UnknownServer => "UnknownServer",
            SendErrorKind::Serialization => "Serialization",
            SendErrorKind::TransactionAborted => "TransactionAborted",
            SendErrorKind::Other => "SendFailure",
        }
    }
}

impl std::fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
