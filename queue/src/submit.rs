//! Submission side of the file-drop queue.
//!
//! A [`JobBundler`] accumulates (metadata, binary) pairs in a private
//! staging directory and publishes them as exactly one gzip tar. The
//! archive becomes visible to the polling backend through an atomic rename
//! inside the shared input directory, a concurrent poller either sees the
//! complete archive or nothing. One bundler, one archive: after `submit`
//! the instance is spent and only a new bundler can submit again.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::PathBuf;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info};

use beamline_io::{app_version, LineMetadata, ParticleSet, SimInput, ValidationError};

use crate::config::QueueConfig;
use crate::metadata::JobMetadata;
use crate::stamp::{contains_delimiter, unique_stamp, DELIMITER};

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("jobs already submitted, make a new bundler to continue")]
    AlreadySubmitted,
    #[error("the character sequence `__` is not allowed in `{0}`")]
    DelimiterInName(String),
    #[error("no jobs staged, refusing to publish an empty archive")]
    EmptySubmission,
    #[error("an archive named `{0}` already exists in the target directory")]
    Collision(String),
    #[error("a line is required, either per job or at bundler construction")]
    MissingLine,
    #[error("failed to build the simulation input")]
    Input(#[from] ValidationError),
    #[error("failed to serialize the job metadata record")]
    Metadata(#[from] serde_json::Error),
    #[error("io failure while staging or publishing")]
    Io(#[from] std::io::Error),
}

/// One job to be staged by [`JobBundler::add`].
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub job_name: String,
    pub num_turns: i64,
    pub particles: ParticleSet,
    /// turn interval for backend checkpoints, negative disables
    pub checkpoint_every: i64,
    /// per-job line, falls back to the bundler-wide one
    pub line: Option<LineMetadata>,
    /// caller extras copied verbatim into the metadata record
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl JobRequest {
    pub fn new(job_name: impl Into<String>, num_turns: i64, particles: ParticleSet) -> Self {
        Self {
            job_name: job_name.into(),
            num_turns,
            particles,
            checkpoint_every: -1,
            line: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn line(mut self, line: LineMetadata) -> Self {
        self.line = Some(line);
        self
    }

    pub fn checkpoint_every(mut self, every: i64) -> Self {
        self.checkpoint_every = every;
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// Accumulates jobs for one study and publishes them as a single archive.
#[derive(Debug)]
pub struct JobBundler {
    user: String,
    study_name: String,
    target: PathBuf,
    archive_name: String,
    line: Option<LineMetadata>,
    staging: TempDir,
    staged: Vec<PathBuf>,
    submitted: bool,
}

impl JobBundler {
    /// open a bundler for `(user, study)`, optionally with a shared line
    ///
    /// Providing the line here instead of per job skips re-deriving the
    /// element counts on every `add`.
    pub fn new(
        config: &QueueConfig,
        user: &str,
        study_name: &str,
        line: Option<LineMetadata>,
    ) -> Result<Self, SubmitError> {
        for name in [user, study_name] {
            if contains_delimiter(name) {
                return Err(SubmitError::DelimiterInName(name.to_string()));
            }
        }
        let archive_name = format!(
            "{user}{DELIMITER}{study_name}{DELIMITER}{}.tar.gz",
            unique_stamp()
        );
        Ok(Self {
            user: user.to_string(),
            study_name: study_name.to_string(),
            target: config.input_dir(),
            archive_name,
            line,
            staging: TempDir::new()?,
            staged: Vec::new(),
            submitted: false,
        })
    }

    /// jobs staged so far
    pub fn num_staged(&self) -> usize {
        self.staged.len() / 2
    }

    fn assert_not_submitted(&self) -> Result<(), SubmitError> {
        if self.submitted {
            Err(SubmitError::AlreadySubmitted)
        } else {
            Ok(())
        }
    }

    /// stage one job as a metadata record plus a binary work unit
    ///
    /// Both files share a base name built from a strictly increasing
    /// millisecond stamp, rapid back-to-back adds cannot collide.
    pub fn add(&mut self, request: JobRequest) -> Result<(), SubmitError> {
        self.assert_not_submitted()?;
        if contains_delimiter(&request.job_name) {
            return Err(SubmitError::DelimiterInName(request.job_name));
        }
        let line = match request.line.or_else(|| self.line.clone()) {
            Some(line) => line,
            None => return Err(SubmitError::MissingLine),
        };

        let base = format!("{}{DELIMITER}{}", self.user, unique_stamp());
        let record = JobMetadata {
            user: self.user.clone(),
            study_name: self.study_name.clone(),
            job_name: request.job_name.clone(),
            app_version: app_version(),
            num_elements: line.kind_counts(),
            num_part: request.particles.num_active(),
            num_turns: request.num_turns,
            extras: request.extras,
        };
        let json_file = self.staging.path().join(format!("{base}.json"));
        serde_json::to_writer(File::create(&json_file)?, &record)?;

        // names never travel in the binary, the backend works by index
        let input = SimInput::builder()
            .line(line)
            .particles(request.particles)
            .num_turns(request.num_turns)
            .checkpoint_every(request.checkpoint_every)
            .store_element_names(false)
            .build()?;
        let bin_file = self.staging.path().join(format!("{base}.bin"));
        input.to_binary(&bin_file)?;

        debug!(job = %request.job_name, base = %base, "staged job");
        self.staged.push(json_file);
        self.staged.push(bin_file);
        Ok(())
    }

    /// pack all staged pairs into one archive and publish it atomically
    ///
    /// The tar is assembled in the staging directory, copied into the
    /// target under a dot-prefixed name no poller matches, and renamed into
    /// its final name in one step. Staged member files are removed after a
    /// successful publish.
    pub fn submit(&mut self) -> Result<PathBuf, SubmitError> {
        self.assert_not_submitted()?;
        if self.staged.is_empty() {
            return Err(SubmitError::EmptySubmission);
        }

        let archive = self.staging.path().join(&self.archive_name);
        let encoder = GzEncoder::new(File::create(&archive)?, Compression::default());
        let mut tar = tar::Builder::new(encoder);
        for member in &self.staged {
            // member paths are staged by add(), the file name is always set
            let name = member.file_name().unwrap();
            tar.append_path_with_name(member, name)?;
        }
        tar.into_inner()?.finish()?;

        let published = self.target.join(&self.archive_name);
        if published.exists() {
            return Err(SubmitError::Collision(self.archive_name.clone()));
        }
        // land on the target filesystem first, then flip visible atomically
        let hidden = self.target.join(format!(".{}", self.archive_name));
        fs::copy(&archive, &hidden)?;
        fs::rename(&hidden, &published)?;

        for member in self.staged.drain(..) {
            fs::remove_file(&member)?;
        }
        self.submitted = true;
        info!(
            archive = ?published,
            study = %self.study_name,
            "submitted study archive"
        );
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_io::Element;

    fn sample_line() -> LineMetadata {
        LineMetadata::new(vec![
            Element::Drift { length: 1.0 },
            Element::Multipole {
                knl: [1e-4, 0.0, 0.0, 0.0],
            },
            Element::Drift { length: 1.0 },
        ])
    }

    fn sample_particles() -> ParticleSet {
        ParticleSet::from_positions(vec![0.01, 0.02], vec![0.0, -0.01])
    }

    fn queue_with_dirs() -> (tempfile::TempDir, QueueConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::dev(dir.path());
        fs::create_dir_all(config.input_dir()).unwrap();
        fs::create_dir_all(config.output_dir()).unwrap();
        (dir, config)
    }

    #[test]
    fn delimiter_is_reserved() {
        let (_dir, config) = queue_with_dirs();
        assert!(matches!(
            JobBundler::new(&config, "user", "bad__study", None),
            Err(SubmitError::DelimiterInName(_))
        ));
        assert!(matches!(
            JobBundler::new(&config, "bad__user", "study", None),
            Err(SubmitError::DelimiterInName(_))
        ));

        let mut bundler =
            JobBundler::new(&config, "user", "study", Some(sample_line())).unwrap();
        assert!(matches!(
            bundler.add(JobRequest::new("bad__job", 10, sample_particles())),
            Err(SubmitError::DelimiterInName(_))
        ));
    }

    #[test]
    fn bundler_is_spent_after_submit() {
        let (_dir, config) = queue_with_dirs();
        let mut bundler =
            JobBundler::new(&config, "user", "study", Some(sample_line())).unwrap();
        bundler
            .add(JobRequest::new("job0", 10, sample_particles()))
            .unwrap();
        bundler.submit().unwrap();

        assert!(matches!(
            bundler.add(JobRequest::new("job1", 10, sample_particles())),
            Err(SubmitError::AlreadySubmitted)
        ));
        assert!(matches!(bundler.submit(), Err(SubmitError::AlreadySubmitted)));
    }

    #[test]
    fn empty_submission_fails_fast() {
        let (_dir, config) = queue_with_dirs();
        let mut bundler = JobBundler::new(&config, "user", "study", None).unwrap();
        assert!(matches!(bundler.submit(), Err(SubmitError::EmptySubmission)));
        // still usable, nothing was spent
        bundler
            .add(
                JobRequest::new("job0", 10, sample_particles()).line(sample_line()),
            )
            .unwrap();
        bundler.submit().unwrap();
    }

    #[test]
    fn missing_line_is_rejected() {
        let (_dir, config) = queue_with_dirs();
        let mut bundler = JobBundler::new(&config, "user", "study", None).unwrap();
        assert!(matches!(
            bundler.add(JobRequest::new("job0", 10, sample_particles())),
            Err(SubmitError::MissingLine)
        ));
    }

    #[test]
    fn publishing_never_overwrites() {
        let (_dir, config) = queue_with_dirs();
        let mut bundler =
            JobBundler::new(&config, "user", "study", Some(sample_line())).unwrap();
        bundler
            .add(JobRequest::new("job0", 10, sample_particles()))
            .unwrap();
        // somebody else already published under the very same name
        fs::write(config.input_dir().join(&bundler.archive_name), b"taken").unwrap();
        assert!(matches!(bundler.submit(), Err(SubmitError::Collision(_))));
    }
}
