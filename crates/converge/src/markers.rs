//! Persisted completion markers, one JSON file per component.
//!
//! A marker is written only after a component verified, is never edited in
//! place, and is deleted when the component stops verifying.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MARKER_VERSION: u32 = 1;
const MARKER_EXT: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMarker {
    pub version: u32,
    pub component: String,
    /// How the component reached its state ("apply", "adopted", ...).
    pub method: String,
    pub completed_at: String,
    pub fingerprint: String,
    #[serde(default)]
    pub attempts: u32,
}

impl StateMarker {
    pub fn new(
        component: impl Into<String>,
        method: impl Into<String>,
        fingerprint: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            version: MARKER_VERSION,
            component: component.into(),
            method: method.into(),
            completed_at: chrono::Utc::now().to_rfc3339(),
            fingerprint: fingerprint.into(),
            attempts,
        }
    }
}

/// What is on disk for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerEntry {
    Missing,
    Valid(StateMarker),
    /// Present but unparseable, foreign or from another format version.
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, component: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{MARKER_EXT}", file_component(component)))
    }

    /// Read a marker without changing the store.
    pub fn read(&self, component: &str) -> Result<MarkerEntry> {
        let path = self.path_for(component);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MarkerEntry::Missing),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to read marker {}: {e}",
                    path.display()
                )));
            }
        };
        match serde_json::from_str::<StateMarker>(&raw) {
            Ok(m) if m.component == component && m.version == MARKER_VERSION => {
                Ok(MarkerEntry::Valid(m))
            }
            Ok(_) | Err(_) => {
                tracing::warn!(path = %path.display(), "unreadable state marker");
                Ok(MarkerEntry::Corrupt)
            }
        }
    }

    /// Missing and unreadable markers both read as "not completed".
    pub fn load(&self, component: &str) -> Result<Option<StateMarker>> {
        Ok(match self.read(component)? {
            MarkerEntry::Valid(m) => Some(m),
            MarkerEntry::Missing | MarkerEntry::Corrupt => None,
        })
    }

    pub fn write(&self, marker: &StateMarker) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::msg(format!(
                "failed to create state dir {}: {e}",
                self.dir.display()
            ))
        })?;
        let path = self.path_for(&marker.component);
        let body = serde_json::to_string_pretty(marker)
            .map_err(|e| Error::msg(format!("failed to encode marker: {e}")))?;

        // Write beside the target and rename so readers never see half a marker.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| {
            Error::msg(format!(
                "failed to create temp marker in {}: {e}",
                self.dir.display()
            ))
        })?;
        tmp.write_all(body.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .map_err(|e| Error::msg(format!("failed to write marker: {e}")))?;
        tmp.persist(&path).map_err(|e| {
            Error::msg(format!(
                "failed to persist marker {}: {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(path)
    }

    /// Returns whether a marker was present. Safe to call when nothing exists.
    pub fn remove(&self, component: &str) -> Result<bool> {
        let path = self.path_for(component);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::msg(format!(
                "failed to remove marker {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn list(&self) -> Result<Vec<StateMarker>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(it) => it,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to list state dir {}: {e}",
                    self.dir.display()
                )));
            }
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(MARKER_EXT) {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(m) = serde_json::from_str::<StateMarker>(&raw) {
                out.push(m);
            }
        }
        out.sort_by(|a, b| a.component.cmp(&b.component));
        Ok(out)
    }
}

fn file_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.starts_with('.') {
        out.insert(0, '_');
    }
    out
}
