//! Program files on disk.
//!
//! Each program lives in `program{N}.alt` as JSON holding a description, the
//! eight zone sequences and a display `total_time`. Missing or unreadable
//! files are replaced with a zeroed default so the operator always finds
//! every slot populated.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use oven_core::program::format_total_time;
use oven_core::{SequenceCollection, ZoneSequence};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;

/// Number of program slots, numbered from 1.
pub const PROGRAM_COUNT: u32 = 36;

/// On-disk layout of a program file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramFile {
    #[serde(default)]
    pub description: String,
    pub zone_sequences: Vec<ZoneSequence>,
    #[serde(default)]
    pub total_time: String,
}

impl ProgramFile {
    fn from_collection(description: String, program: &SequenceCollection) -> Self {
        Self {
            description,
            zone_sequences: program.zone_sequences().to_vec(),
            total_time: format_total_time(program.total_duration()).as_str().to_owned(),
        }
    }
}

/// Listing entry returned by [`ProgramStore::list`] and friends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramSummary {
    pub index: u32,
    pub description: String,
    pub total_time: String,
}

/// Directory of numbered program files.
#[derive(Clone, Debug)]
pub struct ProgramStore {
    dir: PathBuf,
}

impl ProgramStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of program `index`.
    pub fn path(&self, index: u32) -> Result<PathBuf, StoreError> {
        if !(1..=PROGRAM_COUNT).contains(&index) {
            return Err(StoreError::InvalidIndex(index));
        }
        Ok(self.dir.join(format!("program{index}.alt")))
    }

    /// Loads program `index` into `program`, overwriting it in place.
    ///
    /// A missing or corrupt file is replaced by the zeroed default. The
    /// stored `total_time` is recomputed and rewritten when stale.
    pub fn load(
        &self,
        index: u32,
        program: &mut SequenceCollection,
    ) -> Result<ProgramSummary, StoreError> {
        let path = self.path(index)?;
        let Some(file) = read_program(&path)? else {
            *program = SequenceCollection::zeroed();
            let file = ProgramFile::from_collection(default_description(index), program);
            self.write(&path, &file)?;
            info!(index, "created default program");
            return Ok(summary(index, file));
        };

        let mut loaded = SequenceCollection::zeroed();
        if let Err(err) = loaded.hydrate(&file.zone_sequences) {
            warn!(path = %path.display(), %err, "invalid program, replacing with default");
            *program = SequenceCollection::zeroed();
            let file = ProgramFile::from_collection(default_description(index), program);
            self.write(&path, &file)?;
            return Ok(summary(index, file));
        }

        *program = loaded;
        let fresh = ProgramFile::from_collection(file.description, program);
        if fresh.total_time != file.total_time {
            self.write(&path, &fresh)?;
        }
        info!(index, description = %fresh.description, "program loaded");
        Ok(summary(index, fresh))
    }

    /// Saves `program` as program `index`. Without a description the stored
    /// one is kept.
    pub fn save(
        &self,
        index: u32,
        program: &SequenceCollection,
        description: Option<&str>,
    ) -> Result<ProgramSummary, StoreError> {
        let path = self.path(index)?;
        let description = match description {
            Some(description) => description.to_owned(),
            None => read_program(&path)
                .ok()
                .flatten()
                .map(|file| file.description)
                .filter(|description| !description.is_empty())
                .unwrap_or_else(|| default_description(index)),
        };
        let file = ProgramFile::from_collection(description, program);
        self.write(&path, &file)?;
        info!(index, description = %file.description, "program saved");
        Ok(summary(index, file))
    }

    /// Summaries of every slot, creating defaults for missing ones.
    pub fn list(&self) -> Result<Vec<ProgramSummary>, StoreError> {
        let mut scratch = SequenceCollection::zeroed();
        (1..=PROGRAM_COUNT)
            .map(|index| self.load(index, &mut scratch))
            .collect()
    }

    fn write(&self, path: &Path, file: &ProgramFile) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let text = serde_json::to_string_pretty(file).map_err(|source| StoreError::Json {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, text).map_err(|source| StoreError::Io {
            path: path.to_owned(),
            source,
        })
    }
}

/// Reads and parses a program file. `Ok(None)` means missing or corrupt.
fn read_program(path: &Path) -> Result<Option<ProgramFile>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_owned(),
                source,
            });
        }
    };
    match serde_json::from_str(&text) {
        Ok(file) => Ok(Some(file)),
        Err(err) => {
            warn!(path = %path.display(), %err, "corrupt program file");
            Ok(None)
        }
    }
}

fn default_description(index: u32) -> String {
    format!("Program {index}")
}

fn summary(index: u32, file: ProgramFile) -> ProgramSummary {
    ProgramSummary {
        index,
        description: file.description,
        total_time: file.total_time,
    }
}
