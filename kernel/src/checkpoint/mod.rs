// Checkpoint Storage Abstraction
//
// Durability contract for the sync checkpoint: the id of the last
// notification whose effects are fully reflected in the cache.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::event::EventId;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint regression: current {current}, attempted {attempted}")]
    Regression { current: EventId, attempted: EventId },

    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

/// Storage backend for the checkpoint.
///
/// Implementations MUST NOT:
/// - Move the checkpoint backwards
/// - Report a commit as successful before it is durable
pub trait CheckpointStore: Send + Sync {
    /// Last committed id, or `None` if nothing was ever applied.
    fn load(&self) -> Result<Option<EventId>, CheckpointError>;

    /// Advance the checkpoint to `id`.
    ///
    /// Committing the current id again is allowed.
    fn commit(&mut self, id: EventId) -> Result<(), CheckpointError>;
}

fn check_advance(current: Option<EventId>, attempted: EventId) -> Result<(), CheckpointError> {
    match current {
        Some(current) if attempted < current => {
            Err(CheckpointError::Regression { current, attempted })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    last: Option<EventId>,
}

impl InMemoryCheckpointStore {
    pub fn new(initial: Option<EventId>) -> Self {
        Self { last: initial }
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self) -> Result<Option<EventId>, CheckpointError> {
        Ok(self.last)
    }

    fn commit(&mut self, id: EventId) -> Result<(), CheckpointError> {
        check_advance(self.last, id)?;
        self.last = Some(id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    last_event_id: EventId,
}

/// Checkpoint persisted as a small JSON file.
///
/// Writes go to a temp file that is renamed over the target.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    last: Option<EventId>,
}

impl FileCheckpointStore {
    /// Open the store, reading any existing checkpoint at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let last = match fs::read_to_string(&path) {
            Ok(data) => {
                let file: CheckpointFile = serde_json::from_str(&data)
                    .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
                Some(file.last_event_id)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, last })
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<EventId>, CheckpointError> {
        Ok(self.last)
    }

    fn commit(&mut self, id: EventId) -> Result<(), CheckpointError> {
        check_advance(self.last, id)?;

        let data = serde_json::to_vec(&CheckpointFile { last_event_id: id })
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;

        self.last = Some(id);
        Ok(())
    }
}
