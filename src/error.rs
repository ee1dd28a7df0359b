use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid configuration: {message}"))]
    Configuration { message: String },

    #[snafu(display("Invalid usage: {message}"))]
    Usage { message: String },

    /// The token is unknown, already finalized, or its lease has lapsed. These
    /// cases are deliberately indistinguishable.
    #[snafu(display("Unidentified ack: {ack}"))]
    UnidentifiedAck { ack: String },

    #[snafu(display("Unidentified id: {id}"))]
    UnidentifiedId { id: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Error encoding or decoding payload"))]
    Payload {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Store error: {message}"))]
    Store { message: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Payload { source }
    }
}

impl Error {
    /// Wraps an unexpected failure from a dependency, keeping it as the source.
    pub fn internal(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Whatever {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    /// Creates an [`Error::Configuration`] with the given message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an [`Error::Usage`] for a call the queue cannot honor as given, such as an empty
    /// batch or a duration that does not fit the clock.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Creates an [`Error::UnidentifiedAck`] for `ack`.
    pub fn unidentified_ack(ack: impl Into<String>) -> Self {
        Self::UnidentifiedAck { ack: ack.into() }
    }

    /// Creates an [`Error::UnidentifiedId`] for `id`.
    pub fn unidentified_id(id: impl Into<String>) -> Self {
        Self::UnidentifiedId { id: id.into() }
    }

    /// Creates an [`Error::Store`] for a backend that failed or returned something it should not
    /// have.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}
