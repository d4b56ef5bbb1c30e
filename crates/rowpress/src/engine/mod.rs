//! The batch lifecycle engine: row processing, completion detection,
//! packaging and batch control, wired over one store.

pub mod control;
pub mod detector;
pub mod packager;
pub mod pause;
pub mod processor;

use std::sync::Arc;

pub use control::BatchControl;
pub use detector::{CompletionDetector, DetectorOutcome};
pub use packager::Packager;
pub use pause::PauseFlags;
pub use processor::{ProcessOutcome, RowProcessor};

use crate::broadcast::BatchEventBroadcaster;
use crate::config::Config;
use crate::db::{Database, DatabaseError};
use crate::error::{ConfigError, Result};
use crate::render::{PdfRenderer, Renderer};
use crate::storage::{BlobStore, FileStorage};
use crate::worker::RetryPolicy;

/// Every engine component, sharing one database, store and event channel.
#[derive(Clone)]
pub struct Engine {
    pub db: Database,
    pub store: Arc<dyn BlobStore>,
    pub events: BatchEventBroadcaster,
    pub pause: PauseFlags,
    pub detector: CompletionDetector,
    pub processor: Arc<RowProcessor>,
    pub control: BatchControl,
}

impl Engine {
    pub fn new(
        db: Database,
        store: Arc<dyn BlobStore>,
        renderer: Arc<dyn Renderer>,
        config: &Config,
    ) -> Self {
        let events = BatchEventBroadcaster::new(config.event_capacity);
        let pause = PauseFlags::new(config.pause_ttl());
        let packager = Arc::new(Packager::new(
            db.clone(),
            Arc::clone(&store),
            events.clone(),
            config.output.archive_prefix.clone(),
        ));
        let detector = CompletionDetector::new(db.clone(), packager, events.clone());
        let processor = Arc::new(RowProcessor::new(
            db.clone(),
            Arc::clone(&store),
            renderer,
            pause.clone(),
            detector.clone(),
            RetryPolicy::from_config(&config.retry),
            events.clone(),
            config.output.clone(),
        ));
        let control = BatchControl::new(
            db.clone(),
            Arc::clone(&store),
            pause.clone(),
            detector.clone(),
            events.clone(),
        );

        Self {
            db,
            store,
            events,
            pause,
            detector,
            processor,
            control,
        }
    }

    /// Opens the configured database and storage root with the built-in PDF
    /// renderer.
    pub fn from_config(config: &Config) -> Result<Self> {
        let db_path = config
            .resolved_database_path()
            .ok_or_else(|| ConfigError::Validation {
                message: "database_path is not set and no home directory was found".to_string(),
            })?;
        let db = Database::open(&db_path)?;
        let store: Arc<dyn BlobStore> = Arc::new(FileStorage::new(&config.storage_root));
        let renderer: Arc<dyn Renderer> =
            Arc::new(PdfRenderer::new(config.output.document_title.clone()));
        Ok(Self::new(db, store, renderer, config))
    }

    /// An engine over an in-memory database, for tests and dry runs.
    pub fn in_memory(
        store: Arc<dyn BlobStore>,
        renderer: Arc<dyn Renderer>,
        config: &Config,
    ) -> std::result::Result<Self, DatabaseError> {
        Ok(Self::new(Database::open_in_memory()?, store, renderer, config))
    }
}
