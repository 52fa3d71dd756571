use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection timed out")]
    ConnTimeout,

    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    #[error("Invalid message format: {message}")]
    InvalidMessage { message: String },

    #[error("Replication error: {message}")]
    Replication { message: String },

    #[error("Schema log entry not found")]
    SchemaLogNotFound,

    #[error("Malformed schema log entry: {0}")]
    MalformedSchemaLog(String),

    #[error("Request exceeds semaphore capacity")]
    RequestTooLarge,

    #[error("Retries exhausted: {0}")]
    RetriesExhausted(Box<Error>),

    #[error("Processor panicked: {0}")]
    ProcessorPanic(String),

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Pipeline errors: {0}")]
    Pipeline(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// True when the error is the cancellation sentinel rather than a failure.
    /// Listeners swallow per-record processor errors but must propagate these.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
