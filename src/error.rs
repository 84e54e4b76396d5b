//! Error types for the mCSD update client

use thiserror::Error;

/// Main result type used throughout the mCSD update client library.
pub type Result<T> = std::result::Result<T, McsdError>;

/// Main error type for the mCSD update client.
///
/// This enum encompasses all possible errors that can occur within the
/// library, providing a unified error handling interface with automatic
/// conversions from the underlying error types.
#[derive(Error, Debug)]
pub enum McsdError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("FHIR error: {0}")]
    Fhir(#[from] FhirError),

    #[error("Rewrite error: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Pass deadline exceeded")]
    DeadlineExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] deadpool_sqlite::rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Errors related to configuration loading, parsing, and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration file: {path}")]
    InvalidFile { path: std::path::PathBuf },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid URL for {key}: {url}")]
    InvalidUrl { key: String, url: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors raised while talking to a remote FHIR directory or the local
/// update-client FHIR server.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory unavailable: {url}")]
    Unavailable { url: String },

    #[error("Authentication rejected by {url}")]
    AuthRejected { url: String },

    #[error("Directory not found: {id}")]
    NotFound { id: String },

    #[error("Required interactions not supported by server: {url}")]
    CapabilityRejected { url: String },

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },
}

/// Errors related to FHIR payload handling.
#[derive(Error, Debug)]
pub enum FhirError {
    #[error("Invalid bundle: {message}")]
    InvalidBundle { message: String },

    #[error("Invalid resource: {message}")]
    InvalidResource { message: String },

    #[error("Unsupported resource type: {resource_type}")]
    UnsupportedResourceType { resource_type: String },

    #[error("Resource validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Errors raised by the reference rewriter.
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("Cross-origin reference to {reference} (directory origin {origin})")]
    CrossOriginReference { reference: String, origin: String },

    #[error("Malformed reference: {reference}")]
    MalformedReference { reference: String },
}

/// Errors related to the registry and resource-map stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage initialization failed: {message}")]
    InitializationFailed { message: String },

    #[error("Database error: {message}")]
    DatabaseError { message: String },

    #[error("Directory not found: {id}")]
    DirectoryNotFound { id: String },

    #[error("Resource map not found for {resource_type}/{directory_resource_id}")]
    MapNotFound {
        resource_type: String,
        directory_resource_id: String,
    },
}

/// Errors raised by the directory-provider refresher.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider unavailable: {url}")]
    Unavailable { url: String },

    #[error("Invalid provider payload: {message}")]
    InvalidPayload { message: String },

    #[error("No provider source configured")]
    NotConfigured,
}

impl McsdError {
    /// Whether this error aborts an entire update pass.
    ///
    /// Per-entry errors (invalid resource, cross-origin reference,
    /// validation failure) are skipped and counted; everything else is
    /// structural and leaves the watermark unchanged.
    pub fn is_fatal_to_pass(&self) -> bool {
        !matches!(
            self,
            McsdError::Fhir(FhirError::InvalidResource { .. })
                | McsdError::Fhir(FhirError::ValidationFailed { .. })
                | McsdError::Rewrite(_)
        )
    }

    /// Whether the error means the pass was cancelled rather than failed.
    /// Cancellation releases the lease without touching failure counters.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, McsdError::Cancelled)
    }
}

/// Trait for validating configuration and data structures.
pub trait Validate {
    type Error;
    fn validate(&self) -> std::result::Result<(), Self::Error>;
}
