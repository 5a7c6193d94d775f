//! Retrieval side of the file-drop queue.
//!
//! A [`ResultRetriever`] is one discrete scan over the shared output
//! directory, yielding decoded results lazily. Archives are claimed one at
//! a time by an atomic rename to a processing prefix right before they are
//! opened, so several pollers can share a directory without double
//! delivery, and stopping iteration early leaves the unvisited archives
//! untouched for the next scan. A consumed archive is removed, delivery is
//! at most once by construction.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use globset::GlobBuilder;
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, info, warn};

use beamline_io::{DecodeError, SimState};

use crate::config::QueueConfig;
use crate::metadata::JobMetadata;
use crate::stamp::{contains_delimiter, DELIMITER};

/// prefix marking an archive as claimed by a retriever
pub const PROCESSING_PREFIX: &str = "[processing]_";

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("the character sequence `__` is not allowed in `{0}`")]
    DelimiterInName(String),
    #[error("failed to build the archive discovery pattern")]
    Pattern(#[from] globset::Error),
    #[error("failed to scan the output directory")]
    Scan(#[source] std::io::Error),
    #[error("failed to unpack archive `{archive}`")]
    Unpack {
        archive: String,
        #[source]
        source: std::io::Error,
    },
    #[error("member `{member}` is missing its `{missing}` sibling")]
    UnpairedMember {
        member: String,
        missing: &'static str,
    },
    #[error("metadata record for `{member}` is not valid json")]
    Metadata {
        member: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("work unit `{member}` failed to decode")]
    Decode {
        member: String,
        #[source]
        source: DecodeError,
    },
    #[error("failed to remove consumed archive `{archive}`")]
    Cleanup {
        archive: String,
        #[source]
        source: std::io::Error,
    },
}

/// One decoded job result paired with its metadata record.
#[derive(Debug)]
pub struct JobResult {
    pub job_name: String,
    pub metadata: JobMetadata,
    pub state: SimState,
}

/// Lazy, finite iterator over the results of one directory scan.
///
/// Yields `Err` for members that fail validation and keeps going with the
/// rest of the archive, the caller decides whether a single bad job sinks
/// the batch. Ordering follows the directory scan, callers wanting more
/// sort by the metadata fields themselves.
#[derive(Debug)]
pub struct ResultRetriever {
    candidates: VecDeque<PathBuf>,
    pending: VecDeque<Result<JobResult, RetrievalError>>,
}

impl ResultRetriever {
    /// scan the output directory for `{user}__{study}__*.tar.gz`
    pub fn iterate(
        config: &QueueConfig,
        user: &str,
        study_name: &str,
    ) -> Result<Self, RetrievalError> {
        for name in [user, study_name] {
            if contains_delimiter(name) {
                return Err(RetrievalError::DelimiterInName(name.to_string()));
            }
        }
        let matcher = GlobBuilder::new(&format!(
            "{user}{DELIMITER}{study_name}{DELIMITER}*.tar.gz"
        ))
        .build()?
        .compile_matcher();

        let mut candidates = VecDeque::new();
        let output_dir = config.output_dir();
        for entry in fs::read_dir(&output_dir).map_err(RetrievalError::Scan)? {
            let entry = entry.map_err(RetrievalError::Scan)?;
            if matcher.is_match(PathBuf::from(entry.file_name())) {
                candidates.push_back(entry.path());
            }
        }
        debug!(dir = ?output_dir, count = candidates.len(), "discovered result archives");
        Ok(Self {
            candidates,
            pending: VecDeque::new(),
        })
    }

    /// claim the archive by renaming it out of the pollers' view
    ///
    /// Losing the race to another poller is not an error, the archive is
    /// simply somebody else's now.
    fn claim(path: &Path) -> Option<PathBuf> {
        let file_name = path.file_name()?.to_string_lossy();
        let claimed = path.with_file_name(format!("{PROCESSING_PREFIX}{file_name}"));
        match fs::rename(path, &claimed) {
            Ok(()) => Some(claimed),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "archive vanished between scan and claim");
                None
            }
            Err(error) => {
                warn!(path = ?path, error = ?error, "failed to claim archive");
                None
            }
        }
    }

    /// unpack one claimed archive and queue everything it holds
    fn drain_archive(&mut self, claimed: &Path, original_name: &str) {
        let unpacked = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(source) => {
                self.pending.push_back(Err(RetrievalError::Unpack {
                    archive: original_name.to_string(),
                    source,
                }));
                return;
            }
        };
        let opened = File::open(claimed).and_then(|file| {
            tar::Archive::new(GzDecoder::new(file)).unpack(unpacked.path())
        });
        if let Err(source) = opened {
            // leave the claimed file behind for inspection, it will not be
            // redelivered
            self.pending.push_back(Err(RetrievalError::Unpack {
                archive: original_name.to_string(),
                source,
            }));
            return;
        }

        let mut stems = Vec::new();
        if let Ok(entries) = fs::read_dir(unpacked.path()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Some(stem) = path.file_stem() {
                    stems.push(unpacked.path().join(stem));
                }
            }
        }

        // every pair contributes its stem twice, once per extension
        for stem in stems.into_iter().unique().sorted() {
            let bin = stem.with_extension("bin");
            let json = stem.with_extension("json");
            let member = stem
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !json.is_file() {
                self.pending.push_back(Err(RetrievalError::UnpairedMember {
                    member,
                    missing: "json",
                }));
                continue;
            }
            if !bin.is_file() {
                self.pending.push_back(Err(RetrievalError::UnpairedMember {
                    member,
                    missing: "bin",
                }));
                continue;
            }
            self.pending.push_back(Self::decode_pair(&bin, &json, member));
        }

        match fs::remove_file(claimed) {
            Ok(()) => debug!(archive = %original_name, "consumed archive"),
            Err(source) => self.pending.push_back(Err(RetrievalError::Cleanup {
                archive: original_name.to_string(),
                source,
            })),
        }
    }

    fn decode_pair(
        bin: &Path,
        json: &Path,
        member: String,
    ) -> Result<JobResult, RetrievalError> {
        let file = File::open(json).map_err(|source| RetrievalError::Metadata {
            member: member.clone(),
            source: serde_json::Error::io(source),
        })?;
        let metadata: JobMetadata =
            serde_json::from_reader(file).map_err(|source| RetrievalError::Metadata {
                member: member.clone(),
                source,
            })?;
        // from here on the offending job can be named, not just the member
        let state = SimState::from_binary(bin).map_err(|source| RetrievalError::Decode {
            member: metadata.job_name.clone(),
            source,
        })?;
        Ok(JobResult {
            job_name: metadata.job_name.clone(),
            metadata,
            state,
        })
    }
}

impl Iterator for ResultRetriever {
    type Item = Result<JobResult, RetrievalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(result) = self.pending.pop_front() {
                if let Ok(ref result) = result {
                    info!(job = %result.job_name, "retrieved job result");
                }
                return Some(result);
            }
            let candidate = self.candidates.pop_front()?;
            let original_name = candidate
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(claimed) = Self::claim(&candidate) {
                self.drain_archive(&claimed, &original_name);
            }
        }
    }
}
