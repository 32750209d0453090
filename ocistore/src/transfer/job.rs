use std::collections::BTreeSet;
use std::fmt;

use tracing::{error, info};
use uuid::Uuid;

use super::failure::{JobFailure, OperationFailure};
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// Lifecycle of a transfer job. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Validating,
    ParsingReference,
    TransferringBlobs,
    CommittingManifest,
    FetchingManifest,
    FetchingBlobs,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Validating => "validating",
            JobState::ParsingReference => "parsing reference",
            JobState::TransferringBlobs => "transferring blobs",
            JobState::CommittingManifest => "committing manifest",
            JobState::FetchingManifest => "fetching manifest",
            JobState::FetchingBlobs => "fetching blobs",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One push or pull. Lives for a single invocation and is never persisted.
#[derive(Debug)]
pub struct TransferJob {
    id: Uuid,
    direction: Direction,
    state: JobState,
    /// Keys still to transfer
    pending: BTreeSet<String>,
    completed: Vec<String>,
    cause: Option<String>,
}

impl TransferJob {
    pub fn new(direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            state: JobState::Pending,
            pending: BTreeSet::new(),
            completed: Vec::new(),
            cause: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Why the job failed, once it has.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// Move to `next`, which must follow the current state for this direction.
    pub fn advance(&mut self, next: JobState) -> Result<()> {
        if !self.allows(next) {
            return Err(AppError::Internal(format!(
                "invalid {:?} job transition from {} to {}",
                self.direction, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn allows(&self, next: JobState) -> bool {
        use JobState::*;

        if self.state.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        match (self.direction, self.state, next) {
            (_, Pending, Validating) => true,
            (_, Validating, ParsingReference) => true,
            (Direction::Push, ParsingReference, TransferringBlobs) => true,
            (Direction::Push, TransferringBlobs, CommittingManifest) => true,
            (Direction::Push, CommittingManifest, Complete) => true,
            (Direction::Pull, ParsingReference, FetchingManifest) => true,
            (Direction::Pull, FetchingManifest, FetchingBlobs) => true,
            (Direction::Pull, FetchingBlobs, Complete) => true,
            _ => false,
        }
    }

    pub fn track<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.pending.extend(keys);
    }

    pub fn mark_done(&mut self, key: &str) {
        if self.pending.remove(key) {
            self.completed.push(key.to_string());
        }
    }

    pub fn complete(&mut self) -> Result<()> {
        self.advance(JobState::Complete)?;
        info!("Transfer job {} complete", self.id);
        Ok(())
    }

    /// Record `err` as the terminal cause and hand it back for propagation.
    pub fn fail(&mut self, err: AppError) -> AppError {
        error!("Transfer job {} failed while {}: {}", self.id, self.state, err);
        self.cause = Some(err.to_string());
        self.state = JobState::Failed;
        err
    }

    /// Fail with the storage operations that went wrong in the current state.
    pub fn fail_with(&mut self, failures: Vec<OperationFailure>) -> AppError {
        let failure = JobFailure {
            job_id: self.id,
            state: self.state,
            failures,
            completed: self.completed.clone(),
        };
        self.fail(AppError::Transfer(failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_lifecycle() {
        let mut job = TransferJob::new(Direction::Push);
        for state in [
            JobState::Validating,
            JobState::ParsingReference,
            JobState::TransferringBlobs,
            JobState::CommittingManifest,
        ] {
            job.advance(state).unwrap();
        }
        job.complete().unwrap();
        assert_eq!(job.state(), JobState::Complete);
        assert!(job.advance(JobState::Failed).is_err());
    }

    #[test]
    fn test_pull_cannot_commit_manifest() {
        let mut job = TransferJob::new(Direction::Pull);
        job.advance(JobState::Validating).unwrap();
        job.advance(JobState::ParsingReference).unwrap();
        assert!(job.advance(JobState::TransferringBlobs).is_err());
        job.advance(JobState::FetchingManifest).unwrap();
        assert!(job.advance(JobState::Complete).is_err());
        job.advance(JobState::FetchingBlobs).unwrap();
        job.complete().unwrap();
    }

    #[test]
    fn test_cannot_skip_validation() {
        let mut job = TransferJob::new(Direction::Push);
        assert!(job.advance(JobState::ParsingReference).is_err());
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut job = TransferJob::new(Direction::Push);
        job.advance(JobState::Validating).unwrap();
        let err = job.fail(AppError::Internal("boom".to_string()));
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.cause().unwrap().contains("boom"));
        assert!(job.advance(JobState::ParsingReference).is_err());
    }

    #[test]
    fn test_tracks_pending_and_completed() {
        let mut job = TransferJob::new(Direction::Push);
        job.track(vec!["a".to_string(), "b".to_string()]);
        job.mark_done("a");
        job.mark_done("unknown");
        assert_eq!(job.pending().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(job.completed().to_vec(), vec!["a".to_string()]);
    }
}
