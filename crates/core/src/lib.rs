pub mod config;
mod connections;
mod engine;
mod error;
pub mod logging;
pub mod progress;
pub mod retry;
mod space_name;
pub mod storage;

pub const APP_NAME: &str = "blobshift";

pub use config::{
    DestinationSettings, MigrationConfig, RetryConfig, Settings, SourceSettings, load_settings,
};
pub use connections::Connections;
pub use engine::{MigrationEngine, MigrationOptions, SpaceResponse, UploadResult};
pub use error::{Error, Result};
pub use progress::{
    FileError, MigrationPhase, MigrationProgress, MigrationStatus, ProgressManager, ProgressUpdate,
};
pub use retry::{RetryPolicy, with_retry};
pub use space_name::SpaceNameGenerator;
pub use storage::{
    CollectionSource, DestinationAdapter, FsDestination, FsSource, InMemoryCollections,
    InMemoryDestination, InMemorySource, Namespace, SourceAdapter, SqliteCollectionSource,
    StoredUnit, Unit, UploadReceipt,
};
