use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SheetDiffError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Alignment failed: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("Compositing failed: {0}")]
    Composite(#[from] CompositeError),

    #[error("Page extraction error: {0}")]
    Page(#[from] PageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    #[error("External service error: {0}")]
    Service(#[from] crate::services::ServiceError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] crate::pipeline::OrchestratorError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to resolve secret: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Image has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// Registration failures. Each is reported distinctly and never replaced by
/// an identity transform.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("Not enough keypoints (old: {old}, new: {new}; need at least 2 in each)")]
    InsufficientKeypoints { old: usize, new: usize },

    #[error("Not enough good matches ({found}; need at least 3)")]
    InsufficientMatches { found: usize },

    #[error(
        "No transform satisfies the scale/rotation constraints \
         ({matches} matches, {candidates_rejected} candidate models rejected)"
    )]
    NoConstrainedModel {
        matches: usize,
        candidates_rejected: usize,
    },

    #[error("Image error during alignment: {0}")]
    Image(String),
}

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("Invalid compositing parameter '{name}': {value}")]
    InvalidParameter { name: &'static str, value: f32 },

    #[error("Mask computation produced a non-finite value at ({x}, {y})")]
    NonFinite { x: u32, y: u32 },

    #[error("Cannot composite an empty image ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Image dimensions do not match ({old_w}x{old_h} vs {new_w}x{new_h})")]
    DimensionMismatch {
        old_w: u32,
        old_h: u32,
        new_w: u32,
        new_h: u32,
    },
}

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to process PDF: {0}")]
    PdfProcessing(String),

    #[error("Failed to render page {page}: {reason}")]
    Render { page: u32, reason: String },

    #[error("Source document has no pages")]
    NoPages,

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write object '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read object '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid object path '{0}'")]
    InvalidPath(String),

    #[error("Object store lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Message bus is shut down")]
    Closed,

    #[error("Failed to spawn consumer: {0}")]
    SpawnFailed(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Malformed task payload: {0}")]
    MalformedTask(String),

    #[error("Task sent to the wrong worker: expected {expected}, got {actual}")]
    WrongStage { expected: String, actual: String },

    #[error("Missing record: {0}")]
    MissingRecord(String),

    #[error("Every item of the batch failed: {0}")]
    BatchFailed(String),

    #[error(transparent)]
    Alignment(#[from] AlignmentError),

    #[error(transparent)]
    Composite(#[from] CompositeError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to serialize stage output: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Service(#[from] crate::services::ServiceError),

    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),

    #[error(transparent)]
    Orchestrator(#[from] crate::pipeline::OrchestratorError),
}

pub type Result<T> = std::result::Result<T, SheetDiffError>;
