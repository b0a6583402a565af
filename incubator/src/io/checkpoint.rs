//! Checkpoint persistence and verification for resumable runs.
//!
//! The checkpoint (`checkpoint.json`) records which stages are complete and
//! which stage-2 founders are done. Every mutation is a read-merge-write of
//! the on-disk document followed by a durable replace, so fields written by
//! other versions survive. A claim in the checkpoint is only trusted after
//! [`CheckpointStore::verify`] has checked it against the backing files.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::fsutil::write_atomic;
use super::jsonl::{DurableFile, read_jsonl};
use super::run_paths::RunPaths;
use crate::core::types::{ParticipantId, Stage, StageOutputRecord};

pub const FORMAT_VERSION: u32 = 1;

/// On-disk checkpoint. Missing fields default; unknown fields are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    pub format_version: u32,
    pub stage1_complete: bool,
    pub stage2_complete: bool,
    pub stage3_complete: bool,
    pub stage2_participants_done: BTreeSet<ParticipantId>,
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            stage1_complete: false,
            stage2_complete: false,
            stage3_complete: false,
            stage2_participants_done: BTreeSet::new(),
            updated_at: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Coarse progress derived from the checkpoint flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Empty,
    Stage1Done,
    /// Stage 2 in progress with this many founders done.
    Stage2Partial(usize),
    Stage2Done,
    Stage3Done,
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointState::Empty => write!(f, "empty"),
            CheckpointState::Stage1Done => write!(f, "stage 1 done"),
            CheckpointState::Stage2Partial(done) => write!(f, "stage 2 partial ({done} done)"),
            CheckpointState::Stage2Done => write!(f, "stage 2 done"),
            CheckpointState::Stage3Done => write!(f, "stage 3 done"),
        }
    }
}

impl Checkpoint {
    pub fn is_complete(&self, stage: Stage) -> bool {
        match stage {
            Stage::Stage1 => self.stage1_complete,
            Stage::Stage2 => self.stage2_complete,
            Stage::Stage3 => self.stage3_complete,
        }
    }

    fn set_complete(&mut self, stage: Stage, complete: bool) {
        match stage {
            Stage::Stage1 => self.stage1_complete = complete,
            Stage::Stage2 => self.stage2_complete = complete,
            Stage::Stage3 => self.stage3_complete = complete,
        }
    }

    pub fn state(&self) -> CheckpointState {
        if self.stage3_complete {
            CheckpointState::Stage3Done
        } else if self.stage2_complete {
            CheckpointState::Stage2Done
        } else if !self.stage2_participants_done.is_empty() {
            CheckpointState::Stage2Partial(self.stage2_participants_done.len())
        } else if self.stage1_complete {
            CheckpointState::Stage1Done
        } else {
            CheckpointState::Empty
        }
    }
}

/// One backing file and the participants it must hold exactly once each.
#[derive(Debug, Clone, Copy)]
pub struct Backing<'a> {
    pub path: &'a Path,
    pub expected: &'a BTreeSet<ParticipantId>,
}

/// How a backing file disagreed with the checkpoint's claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discrepancy {
    pub file: PathBuf,
    pub missing: BTreeSet<ParticipantId>,
    pub unexpected: BTreeSet<ParticipantId>,
    pub duplicated: BTreeSet<ParticipantId>,
    /// Expected participants with exactly one intact record in the file.
    pub recorded: BTreeSet<ParticipantId>,
    /// Why the file (or part of it) could not be read.
    pub detail: Option<String>,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        let list = |set: &BTreeSet<ParticipantId>| set.iter().cloned().collect::<Vec<_>>().join(",");
        write!(
            f,
            ": missing [{}] unexpected [{}] duplicated [{}]",
            list(&self.missing),
            list(&self.unexpected),
            list(&self.duplicated)
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// The stage is claimed complete and its backing files agree.
    Trusted,
    /// The checkpoint does not claim the stage complete.
    NotClaimed,
    /// The stage is claimed complete but a backing file disagrees.
    Mismatch(Discrepancy),
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(paths: &RunPaths) -> Self {
        Self {
            path: paths.checkpoint_path.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint, or an empty one if the file does not exist.
    pub fn load(&self) -> Result<Checkpoint> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no checkpoint on disk");
            return Ok(Checkpoint::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read checkpoint {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", self.path.display()))
    }

    /// Write an empty checkpoint unless one already exists.
    pub fn initialize(&self) -> Result<Checkpoint> {
        if self.path.exists() {
            return self.load();
        }
        let mut checkpoint = Checkpoint::default();
        self.write(&mut checkpoint)?;
        Ok(checkpoint)
    }

    /// Add `participant` to the stage's done-set.
    pub fn record_participant_done(&self, stage: Stage, participant: &str) -> Result<Checkpoint> {
        if stage != Stage::Stage2 {
            bail!("{stage} does not track per-participant progress");
        }
        self.update(|checkpoint| {
            checkpoint
                .stage2_participants_done
                .insert(participant.to_string());
        })
        .inspect(|_| debug!(stage = %stage, participant, "checkpointed participant"))
    }

    /// Mark `stage` complete. Requires proof that its backing files are durable.
    pub fn record_stage_complete(&self, stage: Stage, files: &[DurableFile]) -> Result<Checkpoint> {
        if files.is_empty() {
            bail!("cannot mark {stage} complete without durable backing files");
        }
        for file in files {
            if !file.path().exists() {
                bail!(
                    "backing file {} for {stage} disappeared before checkpointing",
                    file.path().display()
                );
            }
        }
        let checkpoint = self.update(|checkpoint| checkpoint.set_complete(stage, true))?;
        info!(stage = %stage, files = files.len(), "stage checkpointed complete");
        Ok(checkpoint)
    }

    /// Clear the complete flag of `stage` and every later stage.
    ///
    /// Rerunning stage 1 or 2 also forgets the stage-2 done-set.
    pub fn reset_from(&self, stage: Stage) -> Result<Checkpoint> {
        self.withdraw(stage, &Discrepancy::default())
    }

    /// Restrict the stage-2 done-set to `keep`.
    pub fn retain_participants_done(&self, keep: &BTreeSet<ParticipantId>) -> Result<Checkpoint> {
        self.update(|checkpoint| {
            checkpoint
                .stage2_participants_done
                .retain(|participant| keep.contains(participant));
        })
    }

    /// Withdraw a claim that failed verification.
    ///
    /// Clears `stage` and every later flag. Withdrawing stage 2 keeps the
    /// done founders whose records are still intact in the backing file, so
    /// only the missing ones rerun; withdrawing stage 1 forgets them all.
    pub fn withdraw(&self, stage: Stage, discrepancy: &Discrepancy) -> Result<Checkpoint> {
        self.update(|checkpoint| {
            for later in Stage::ALL.into_iter().filter(|later| *later >= stage) {
                checkpoint.set_complete(later, false);
            }
            match stage {
                Stage::Stage1 => checkpoint.stage2_participants_done.clear(),
                Stage::Stage2 => checkpoint
                    .stage2_participants_done
                    .retain(|participant| discrepancy.recorded.contains(participant)),
                Stage::Stage3 => {}
            }
        })
    }

    /// Check a complete-claim against the stage's backing files.
    ///
    /// Never fails: unreadable or missing files are reported as a mismatch.
    pub fn verify(&self, checkpoint: &Checkpoint, stage: Stage, backing: &[Backing<'_>]) -> Verification {
        if !checkpoint.is_complete(stage) {
            return Verification::NotClaimed;
        }
        for file in backing {
            if let Some(discrepancy) = check_backing_file(file.path, file.expected) {
                warn!(
                    stage = %stage,
                    discrepancy = %discrepancy,
                    "checkpoint claims stage complete but backing file disagrees; rerunning stage"
                );
                return Verification::Mismatch(discrepancy);
            }
        }
        debug!(stage = %stage, "checkpoint claim verified");
        Verification::Trusted
    }

    /// Return the subset of the stage-2 done-set backed by a readable plan file.
    pub fn verify_participants_done(
        &self,
        checkpoint: &Checkpoint,
        paths: &RunPaths,
    ) -> Result<BTreeSet<ParticipantId>> {
        let mut trusted = BTreeSet::new();
        for participant in &checkpoint.stage2_participants_done {
            let Some(version) = paths.latest_plan_version(participant)? else {
                warn!(participant = %participant, "claimed done but no plan file found; rerunning");
                continue;
            };
            let path = paths.plan_version_path(participant, version);
            match read_jsonl::<StageOutputRecord>(&path) {
                Ok(records) if records.iter().any(|r| &r.participant == participant) => {
                    trusted.insert(participant.clone());
                }
                Ok(_) => {
                    warn!(participant = %participant, path = %path.display(), "plan file holds no record; rerunning");
                }
                Err(err) => {
                    warn!(participant = %participant, err = %format!("{err:#}"), "plan file unreadable; rerunning");
                }
            }
        }
        Ok(trusted)
    }

    fn update(&self, mutate: impl FnOnce(&mut Checkpoint)) -> Result<Checkpoint> {
        let mut checkpoint = self.load()?;
        mutate(&mut checkpoint);
        self.write(&mut checkpoint)?;
        Ok(checkpoint)
    }

    fn write(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.updated_at = Some(chrono::Utc::now().to_rfc3339());
        let mut buf = serde_json::to_string_pretty(checkpoint).context("serialize checkpoint")?;
        buf.push('\n');
        write_atomic(&self.path, buf.as_bytes())
    }
}

/// Compare a backing file's participants with `expected`.
///
/// Lines that do not parse (a torn final write) are reported but do not hide
/// the intact records around them.
pub fn check_backing_file(path: &Path, expected: &BTreeSet<ParticipantId>) -> Option<Discrepancy> {
    let mut discrepancy = Discrepancy {
        file: path.to_path_buf(),
        ..Discrepancy::default()
    };
    if !path.exists() {
        discrepancy.missing = expected.clone();
        discrepancy.detail = Some("backing file missing".to_string());
        return Some(discrepancy);
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            discrepancy.missing = expected.clone();
            discrepancy.detail = Some(format!("read failed: {err}"));
            return Some(discrepancy);
        }
    };

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut malformed = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StageOutputRecord>(line) {
            Ok(record) => *counts.entry(record.participant).or_default() += 1,
            Err(_) => malformed.push(index + 1),
        }
    }
    if !malformed.is_empty() {
        discrepancy.detail = Some(format!("malformed lines {malformed:?}"));
    }
    for participant in expected {
        match counts.get(participant) {
            None => {
                discrepancy.missing.insert(participant.clone());
            }
            Some(1) => {
                discrepancy.recorded.insert(participant.clone());
            }
            Some(_) => {}
        }
    }
    for (participant, count) in &counts {
        if !expected.contains(participant) {
            discrepancy.unexpected.insert(participant.clone());
        }
        if *count > 1 {
            discrepancy.duplicated.insert(participant.clone());
        }
    }
    if discrepancy.missing.is_empty()
        && discrepancy.unexpected.is_empty()
        && discrepancy.duplicated.is_empty()
        && discrepancy.detail.is_none()
    {
        None
    } else {
        Some(discrepancy)
    }
}
