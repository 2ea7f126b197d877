/*
 * Channel Ingest CLI - Voice Profile Store
 * Copyright (c) 2025 Channel Ingest Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use crate::diarize::{l2_normalize, VOICE_EMBEDDING_DIM};
use crate::error::IngestError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Enrolled speaker profile: a centroid voice embedding plus enrollment
/// metadata. Stored one per JSON file in the voices directory; read-only
/// during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub name: String,
    pub centroid: Vec<f32>,
    pub sample_count: usize,
    /// Optional per-speaker similarity floor overriding the global one.
    pub threshold_hint: Option<f32>,
    pub created_at: Option<DateTime<Utc>>,
}

/// The loaded profile set: one required host, zero or more guests.
#[derive(Debug, Clone)]
pub struct VoiceProfileStore {
    pub host: Option<VoiceProfile>,
    pub guests: Vec<VoiceProfile>,
    version: String,
}

impl VoiceProfileStore {
    /// Load every `*.json` profile under `dir`. The profile whose name
    /// matches `host_name` (case-insensitive) becomes the host.
    pub fn load(dir: &Path, host_name: &str) -> Result<Self> {
        let mut profiles: Vec<VoiceProfile> = Vec::new();

        if dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(dir)
                .with_context(|| format!("failed to read voices directory {}", dir.display()))?
                .collect::<Result<Vec<_>, _>>()?;
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read profile {}", path.display()))?;
                let mut profile: VoiceProfile = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid profile JSON in {}", path.display()))?;
                if profile.centroid.len() != VOICE_EMBEDDING_DIM {
                    anyhow::bail!(
                        "profile {} has centroid dimension {}, expected {}",
                        profile.name,
                        profile.centroid.len(),
                        VOICE_EMBEDDING_DIM
                    );
                }
                l2_normalize(&mut profile.centroid);
                profiles.push(profile);
            }
        }

        let host_idx = profiles.iter().position(|p| p.name.eq_ignore_ascii_case(host_name));
        let host = host_idx.map(|i| profiles.remove(i));
        let version = compute_version(host.as_ref(), &profiles);

        Ok(Self { host, guests: profiles, version })
    }

    /// An empty store for runs with speaker identification disabled.
    pub fn disabled() -> Self {
        Self { host: None, guests: Vec::new(), version: "none".to_string() }
    }

    /// Fail startup when speaker ID is enabled but no host is enrolled.
    pub fn require_host(&self) -> Result<&VoiceProfile, IngestError> {
        self.host.as_ref().ok_or_else(|| {
            IngestError::Environment(
                "speaker identification is enabled but no host voice profile was found; \
                 enroll one with `enroll-voice` or disable INGEST_ENABLE_SPEAKER_ID"
                    .into(),
            )
        })
    }

    /// Content hash of the loaded profile set. Any centroid or roster
    /// change produces a new version, which forces full re-ingestion.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn profile_count(&self) -> usize {
        self.guests.len() + usize::from(self.host.is_some())
    }
}

/// Write one profile to `<dir>/<name>.json`. Used by enrollment only;
/// ingestion never writes here.
pub fn save_profile(dir: &Path, profile: &VoiceProfile) -> Result<std::path::PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create voices directory {}", dir.display()))?;
    let file_name = format!("{}.json", sanitize_name(&profile.name));
    let path = dir.join(file_name);
    let json = serde_json::to_string_pretty(profile)?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write profile {}", path.display()))?;
    Ok(path)
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// FNV-1a over profile names and centroid bytes, in a stable order. Kept
/// hand-rolled so the version tag survives compiler and std upgrades.
fn compute_version(host: Option<&VoiceProfile>, guests: &[VoiceProfile]) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };

    let mut ordered: Vec<&VoiceProfile> = host.into_iter().chain(guests.iter()).collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));
    for profile in ordered {
        feed(profile.name.as_bytes());
        for value in &profile.centroid {
            feed(&value.to_le_bytes());
        }
    }
    format!("v{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_profile(name: &str, seed: f32) -> VoiceProfile {
        let mut centroid = vec![0.0f32; VOICE_EMBEDDING_DIM];
        for (i, v) in centroid.iter_mut().enumerate() {
            *v = seed + i as f32 * 0.01;
        }
        VoiceProfile {
            name: name.to_string(),
            centroid,
            sample_count: 3,
            threshold_hint: None,
            created_at: Some(Utc::now()),
        }
    }

    #[test]
    fn loads_host_and_guests_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        save_profile(dir.path(), &test_profile("host", 0.2)).unwrap();
        save_profile(dir.path(), &test_profile("alice", 0.5)).unwrap();
        save_profile(dir.path(), &test_profile("bob", 0.8)).unwrap();

        let store = VoiceProfileStore::load(dir.path(), "host").unwrap();
        assert!(store.host.is_some());
        assert_eq!(store.guests.len(), 2);
        assert_eq!(store.profile_count(), 3);
        assert!(store.require_host().is_ok());

        // Centroids come back normalized.
        let norm: f32 =
            store.host.as_ref().unwrap().centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn missing_host_is_an_environment_error() {
        let dir = tempfile::tempdir().unwrap();
        save_profile(dir.path(), &test_profile("alice", 0.5)).unwrap();

        let store = VoiceProfileStore::load(dir.path(), "host").unwrap();
        assert!(matches!(store.require_host(), Err(IngestError::Environment(_))));
    }

    #[test]
    fn rejects_wrong_centroid_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let mut profile = test_profile("host", 0.2);
        profile.centroid.truncate(4);
        save_profile(dir.path(), &profile).unwrap();

        assert!(VoiceProfileStore::load(dir.path(), "host").is_err());
    }

    #[test]
    fn version_changes_with_roster_and_centroids() {
        let dir_a = tempfile::tempdir().unwrap();
        save_profile(dir_a.path(), &test_profile("host", 0.2)).unwrap();
        let store_a = VoiceProfileStore::load(dir_a.path(), "host").unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        save_profile(dir_b.path(), &test_profile("host", 0.2)).unwrap();
        save_profile(dir_b.path(), &test_profile("alice", 0.5)).unwrap();
        let store_b = VoiceProfileStore::load(dir_b.path(), "host").unwrap();

        assert_ne!(store_a.version(), store_b.version());

        // Same inputs produce the same version across loads.
        let store_a2 = VoiceProfileStore::load(dir_a.path(), "host").unwrap();
        assert_eq!(store_a.version(), store_a2.version());
    }

    #[test]
    fn empty_directory_loads_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = VoiceProfileStore::load(dir.path(), "host").unwrap();
        assert!(store.host.is_none());
        assert!(store.guests.is_empty());
    }
}
