//! Local per-viewer volume preferences.
//!
//! Preferences are keyed by `(viewer, remote participant)` and stored in a
//! JSON file on this host. They are never written to the shared call
//! documents.

use common::types::UserId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("preference file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("preference file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

/// Playback settings for one remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumePreference {
    /// Linear gain in `0.0..=1.0`.
    pub volume: f32,
    pub muted: bool,
}

impl Default for VolumePreference {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }
}

type Table = HashMap<UserId, HashMap<UserId, VolumePreference>>;

/// File-backed preference table. Without a path it lives in memory only.
#[derive(Debug, Default)]
pub struct PreferenceStore {
    path: Option<PathBuf>,
    table: Table,
}

impl PreferenceStore {
    /// In-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty table.
    ///
    /// # Errors
    ///
    /// Returns `PreferenceError` if the file exists but cannot be read or
    /// parsed.
    pub fn load(path: PathBuf) -> Result<Self, PreferenceError> {
        let table = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            target: "call.router",
            path = %path.display(),
            viewers = table.len(),
            "Volume preferences loaded"
        );
        Ok(Self {
            path: Some(path),
            table,
        })
    }

    /// Stored preference, or the default when none was set.
    #[must_use]
    pub fn get(&self, viewer: &UserId, remote: &UserId) -> VolumePreference {
        self.table
            .get(viewer)
            .and_then(|prefs| prefs.get(remote))
            .copied()
            .unwrap_or_default()
    }

    /// Store a preference; volume is clamped to `0.0..=1.0`.
    ///
    /// # Errors
    ///
    /// Returns `PreferenceError` if the file cannot be written. The in-memory
    /// value is updated regardless.
    pub fn set(
        &mut self,
        viewer: &UserId,
        remote: &UserId,
        preference: VolumePreference,
    ) -> Result<(), PreferenceError> {
        let volume = if preference.volume.is_nan() {
            1.0
        } else {
            preference.volume.clamp(0.0, 1.0)
        };
        self.table.entry(viewer.clone()).or_default().insert(
            remote.clone(),
            VolumePreference {
                volume,
                muted: preference.muted,
            },
        );
        self.persist()
    }

    fn persist(&self) -> Result<(), PreferenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&self.table)?;
        std::fs::write(path, bytes).map_err(|e| {
            warn!(
                target: "call.router",
                path = %path.display(),
                error = %e,
                "Failed to persist volume preferences"
            );
            PreferenceError::Io(e)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_preferences_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let mut prefs = PreferenceStore::load(path.clone()).unwrap();
        assert_eq!(prefs.get(&alice, &bob), VolumePreference::default());
        prefs
            .set(
                &alice,
                &bob,
                VolumePreference {
                    volume: 0.4,
                    muted: true,
                },
            )
            .unwrap();

        let reloaded = PreferenceStore::load(path).unwrap();
        let stored = reloaded.get(&alice, &bob);
        assert!((stored.volume - 0.4).abs() < f32::EPSILON);
        assert!(stored.muted);
        // Keyed by viewer as well as remote
        assert_eq!(reloaded.get(&bob, &alice), VolumePreference::default());
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut prefs = PreferenceStore::new();
        let (a, b) = (UserId::new("a"), UserId::new("b"));

        prefs
            .set(&a, &b, VolumePreference { volume: 3.0, muted: false })
            .unwrap();
        assert!((prefs.get(&a, &b).volume - 1.0).abs() < f32::EPSILON);

        prefs
            .set(&a, &b, VolumePreference { volume: -1.0, muted: false })
            .unwrap();
        assert!(prefs.get(&a, &b).volume.abs() < f32::EPSILON);
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            PreferenceStore::load(path),
            Err(PreferenceError::Format(_))
        ));
    }
}
