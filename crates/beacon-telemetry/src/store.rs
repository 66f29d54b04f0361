//! Durable offline log for not-yet-confirmed events
//!
//! A keyed append/delete store used purely for crash and offline recovery.
//! Each event is persisted as one JSON file named after its id, so row-level
//! upserts and deletes are atomic without any cross-row coordination. The
//! store's contents are a conservative superset of what must still be
//! retried; deletion must never precede confirmed send success.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, TelemetryError};
use crate::event::{Event, EventStatus};

/// Persistent store of pending events, keyed by event id.
pub struct OfflineStore {
    dir: PathBuf,
    open: bool,
}

impl OfflineStore {
    /// Create a handle rooted at `dir`. No I/O happens until [`init`](Self::init).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: false,
        }
    }

    /// Prepare the underlying directory. Idempotent; fails with a storage
    /// error when the medium is unavailable (missing disk, permissions).
    pub fn init(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|source| TelemetryError::Storage {
            context: format!("creating {}", self.dir.display()),
            source,
        })?;
        self.open = true;
        Ok(())
    }

    fn active_dir(&self) -> Result<&Path> {
        if self.open {
            Ok(&self.dir)
        } else {
            Err(TelemetryError::StoreNotInitialized)
        }
    }

    fn row_path(&self, dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    /// Upsert one event by id. Last write wins, which is what re-persisting
    /// a failed event with a bumped `retry_count` relies on.
    pub fn save(&self, event: &Event) -> Result<()> {
        let dir = self.active_dir()?;
        let body = serde_json::to_vec(event)?;
        fs::write(self.row_path(dir, &event.id), body).map_err(|source| {
            TelemetryError::Storage {
                context: format!("writing event {}", event.id),
                source,
            }
        })
    }

    pub fn save_many(&self, events: &[Event]) -> Result<()> {
        for event in events {
            self.save(event)?;
        }
        Ok(())
    }

    /// Load pending events ordered by timestamp ascending, up to `limit`.
    /// Unreadable rows are skipped with a warning rather than failing the
    /// whole recovery pass.
    pub fn load_pending(&self, limit: Option<usize>) -> Result<Vec<Event>> {
        let dir = self.active_dir()?;
        let entries = fs::read_dir(dir).map_err(|source| TelemetryError::Storage {
            context: format!("reading {}", dir.display()),
            source,
        })?;

        let mut events = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(anyhow::Error::from).and_then(|raw| {
                serde_json::from_slice::<Event>(&raw).map_err(anyhow::Error::from)
            }) {
                Ok(event) => events.push(event),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping unreadable offline row");
                }
            }
        }

        events.sort_by_key(|event| event.timestamp);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Delete one row. Deleting an absent id is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.active_dir()?;
        match fs::remove_file(self.row_path(dir, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TelemetryError::Storage {
                context: format!("deleting event {id}"),
                source,
            }),
        }
    }

    pub fn delete_many<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for id in ids {
            self.delete(id)?;
        }
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let dir = self.active_dir()?;
        let entries = fs::read_dir(dir).map_err(|source| TelemetryError::Storage {
            context: format!("reading {}", dir.display()),
            source,
        })?;
        Ok(entries
            .flatten()
            .filter(|entry| {
                entry.path().extension().and_then(|e| e.to_str()) == Some("json")
            })
            .count())
    }

    pub fn count_by_status(&self, status: EventStatus) -> Result<usize> {
        Ok(self
            .load_pending(None)?
            .iter()
            .filter(|event| event.status == status)
            .count())
    }

    /// Release the storage handle. Idempotent; later operations fail with
    /// [`TelemetryError::StoreNotInitialized`].
    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}
