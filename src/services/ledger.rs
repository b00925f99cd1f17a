//! Integrity ledger: the persisted volume -> (file -> fingerprint) record of a
//! collection's illustrations.
//!
//! The ledger is all-or-nothing. A single missing or modified file makes the whole
//! cached illustration set invalid, and a rewrite always replaces the file in full.

use crate::error::PipelineError;
use crate::models::{IllustrationSet, Resource};
use crate::services::hasher::fingerprint_file;
use crate::utils::is_image_file;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const LEDGER_FILE: &str = ".hash";

/// Volume name -> (file name -> fingerprint). `serde_json` is built with
/// `preserve_order`, so both levels keep the order they were written in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    volumes: Map<String, Value>,
}

/// Outcome of checking a ledger against the working directory.
#[derive(Debug)]
pub enum Validation {
    Valid(IllustrationSet),
    Invalid(PipelineError),
}

/// The recorded files of one volume, or `None` unless the entry maps names to strings.
fn recorded_files(entry: &Value) -> Option<Vec<(&str, &str)>> {
    entry
        .as_object()?
        .iter()
        .map(|(name, fingerprint)| fingerprint.as_str().map(|fp| (name.as_str(), fp)))
        .collect()
}

impl Ledger {
    /// Reads a ledger file. Absent or unparsable files yield `None`.
    pub fn load(path: &Path) -> Option<Ledger> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("no ledger at {}: {}", path.display(), e);
                return None;
            }
        };

        let reason = match serde_json::from_str::<Ledger>(&raw) {
            Ok(ledger) if ledger.volumes.values().all(|v| recorded_files(v).is_some()) => {
                return Some(ledger);
            }
            Ok(_) => "expected volume -> file -> fingerprint strings".to_string(),
            Err(e) => e.to_string(),
        };
        let err = PipelineError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        tracing::warn!("ignoring ledger: {}", err);
        None
    }

    /// Fingerprints every illustration in `illustrations`. Files that cannot be read
    /// are left out, which makes a later `validate` fail.
    pub fn record(illustrations: &IllustrationSet) -> Ledger {
        let mut volumes = Map::new();

        for (volume, resources) in illustrations.iter() {
            let mut files = Map::new();
            for resource in resources {
                let Some(file_name) = resource.path.file_name().and_then(|n| n.to_str()) else {
                    tracing::warn!("skipping unnamed resource {}", resource.path.display());
                    continue;
                };
                match fingerprint_file(&resource.path) {
                    Some(fingerprint) => {
                        files.insert(file_name.to_string(), Value::String(fingerprint));
                    }
                    None => tracing::warn!(
                        volume,
                        "omitting {} from ledger, file unreadable",
                        resource.path.display()
                    ),
                }
            }
            volumes.insert(volume.to_string(), Value::Object(files));
        }

        Ledger { volumes }
    }

    /// Records `illustrations` and writes the full ledger to `path`.
    pub fn save(path: &Path, illustrations: &IllustrationSet) -> Result<Ledger> {
        let ledger = Ledger::record(illustrations);
        ledger.write(path)?;
        tracing::info!(
            volumes = ledger.volume_count(),
            files = ledger.file_count(),
            "ledger saved to {}",
            path.display()
        );
        Ok(ledger)
    }

    /// Writes the ledger next to `path` and renames it into place.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let tmp = temp_sibling(path);
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move ledger into {}", path.display()))?;
        Ok(())
    }

    /// Pretty JSON with four-space indentation; non-ASCII names stay readable.
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8(out)?)
    }

    /// Recomputes every recorded fingerprint under `base_dir`. Stops at the first
    /// missing directory, missing file or mismatch.
    pub fn validate(&self, base_dir: &Path) -> Validation {
        let mut resolved = IllustrationSet::new();

        for (volume, entry) in &self.volumes {
            let volume_dir = base_dir.join(volume);
            let files = match recorded_files(entry) {
                Some(files) if volume_dir.is_dir() => files,
                _ => return Validation::Invalid(PipelineError::IntegrityMismatch { path: volume_dir }),
            };

            let mut resources = Vec::with_capacity(files.len());
            for (file_name, expected) in files {
                let path = volume_dir.join(file_name);
                match fingerprint_file(&path) {
                    Some(actual) if actual == expected => resources.push(Resource {
                        name: file_name.to_string(),
                        path,
                        fingerprint: actual,
                    }),
                    _ => return Validation::Invalid(PipelineError::IntegrityMismatch { path }),
                }
            }
            resolved.insert(volume.clone(), resources);
        }

        Validation::Valid(resolved)
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn file_count(&self) -> usize {
        self.volumes
            .values()
            .map(|files| files.as_object().map_or(0, Map::len))
            .sum()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| LEDGER_FILE.into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Builds a ledger for a working directory that was populated without one, treating
/// every subdirectory holding images as an illustrated volume. Nothing is written
/// when no image is found.
pub fn rebuild_ledger(workdir: &Path) -> Result<Option<Ledger>> {
    let mut volume_dirs: Vec<PathBuf> = fs::read_dir(workdir)
        .with_context(|| format!("Failed to list {}", workdir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    volume_dirs.sort();

    let mut illustrations = IllustrationSet::new();
    for dir in volume_dirs {
        let Some(volume) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };

        let mut images: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_file(path))
            .collect();
        images.sort();

        if images.is_empty() {
            continue;
        }

        tracing::info!("found {} illustrations in volume {}", images.len(), volume);
        let resources = images
            .into_iter()
            .map(|path| Resource {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path,
                fingerprint: String::new(),
            })
            .collect();
        illustrations.insert(volume, resources);
    }

    if illustrations.is_empty() {
        tracing::info!("no illustration folders in {}, skipping", workdir.display());
        return Ok(None);
    }

    Ledger::save(&workdir.join(LEDGER_FILE), &illustrations).map(Some)
}

/// Runs `rebuild_ledger` for every collection directory under `root`. Returns how
/// many ledgers were written; a failing collection is logged and skipped.
pub fn rebuild_ledgers(root: &Path) -> Result<usize> {
    let mut collections: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to list {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    collections.sort();

    let mut written = 0;
    for workdir in collections {
        tracing::info!("rebuilding ledger for {}", workdir.display());
        match rebuild_ledger(&workdir) {
            Ok(Some(_)) => written += 1,
            Ok(None) => {}
            Err(e) => tracing::warn!("ledger rebuild failed for {}: {:#}", workdir.display(), e),
        }
    }
    Ok(written)
}
