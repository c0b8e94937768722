pub mod broadcast;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod imaging;
pub mod logging;
pub mod pages;
pub mod pipeline;
pub mod runtime;
pub mod secrets;
pub mod services;
pub mod storage;
pub mod worker;

pub use broadcast::{StageEvent, StageEventBroadcaster};
pub use bus::{MemoryBus, MessageBus, Topic};
pub use config::{load_config, Config, PipelineMode};
pub use db::Database;
pub use error::{
    AlignmentError, CompositeError, ConfigError, ImageError, PageError, Result, SheetDiffError,
    StorageError, WorkerError,
};
pub use imaging::{FeatureAligner, OverlayCompositor};
pub use pages::PageExtractor;
pub use pipeline::{JobStatus, NewJob, Orchestrator, StageKey, StageKind, StageStatus, StageStore};
pub use runtime::{Runtime, Services};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectRef, ObjectStore};
