//! Job entity and its serializable projection.

use crate::error::JobError;
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use uuid::Uuid;

/// Unique, time-ordered identifier for a job.
///
/// Formatted as `YYYYMMDDHHMMSS_<uuid>` so that lexicographic order tracks
/// creation order at second granularity. The value is otherwise opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh id stamped with the current UTC time.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!(
            "{}_{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            Uuid::new_v4()
        ))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creation parameters for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Who or what submitted the job (a username, or `file_watcher`).
    pub submitter: String,
    /// Registry key selecting the external handler.
    pub job_type: String,
    /// Opaque, handler-specific parameters.
    pub job_demands: serde_json::Value,
    /// File names that must arrive under `local_folder` before dispatch.
    pub expected_files: Vec<String>,
    /// Folder the expected files arrive in.
    pub local_folder: PathBuf,
    /// Human-readable job name.
    pub job_name: String,
    /// The watcher that spawned this job, if any.
    pub watcher_id: Option<i64>,
}

/// In-memory unit of work.
///
/// The canonical copy of a job lives in the queue manager as an `Arc<Job>`.
/// Status, progress, the expected-file set and the extras bag are each
/// guarded by their own lock, independent of any queue-collection lock, so
/// concurrent readers always observe a whole value for each field.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    submitter: String,
    job_type: String,
    job_demands: serde_json::Value,
    job_name: String,
    local_folder: PathBuf,
    watcher_id: Option<i64>,
    created_at: DateTime<Utc>,
    original_expected_files: BTreeSet<String>,
    expected_files: Mutex<BTreeSet<String>>,
    status: RwLock<JobStatus>,
    progress: Mutex<f64>,
    extras: Mutex<HashMap<String, String>>,
}

/// Tolerance for floating-point progress boundary checks.
const PROGRESS_EPSILON: f64 = 1e-9;

impl Job {
    /// Creates a new job in the `Waiting` state.
    #[must_use]
    pub fn new(spec: JobSpec) -> Self {
        let original: BTreeSet<String> = spec.expected_files.into_iter().collect();
        Self {
            id: JobId::generate(),
            submitter: spec.submitter,
            job_type: spec.job_type,
            job_demands: spec.job_demands,
            job_name: spec.job_name,
            local_folder: spec.local_folder,
            watcher_id: spec.watcher_id,
            created_at: Utc::now(),
            expected_files: Mutex::new(original.clone()),
            original_expected_files: original,
            status: RwLock::new(JobStatus::Waiting),
            progress: Mutex::new(0.0),
            extras: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstructs a job from its stored projection.
    ///
    /// Used after a restart when a stored record has no live counterpart;
    /// the status is taken verbatim rather than run through the transition
    /// table.
    #[must_use]
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.job_id.clone(),
            submitter: record.job_submitter.clone(),
            job_type: record.job_type.clone(),
            job_demands: record.job_demands.clone(),
            job_name: record.job_name.clone(),
            local_folder: record.local_folder.clone(),
            watcher_id: record.watcher_id,
            created_at: record.created_at,
            expected_files: Mutex::new(record.expected_files.iter().cloned().collect()),
            original_expected_files: record.original_expected_files.iter().cloned().collect(),
            status: RwLock::new(record.status),
            progress: Mutex::new(record.progress),
            extras: Mutex::new(record.extras.clone()),
        }
    }

    /// Returns the job id.
    #[must_use]
    pub const fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the submitter.
    #[must_use]
    pub fn submitter(&self) -> &str {
        &self.submitter
    }

    /// Returns the job type (handler registry key).
    #[must_use]
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Returns the handler-specific parameters.
    #[must_use]
    pub const fn job_demands(&self) -> &serde_json::Value {
        &self.job_demands
    }

    /// Returns the job name.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Returns the folder expected files arrive in.
    #[must_use]
    pub fn local_folder(&self) -> &Path {
        &self.local_folder
    }

    /// Returns the id of the watcher that spawned this job, if any.
    #[must_use]
    pub const fn watcher_id(&self) -> Option<i64> {
        self.watcher_id
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the immutable snapshot of the originally expected files.
    #[must_use]
    pub const fn original_expected_files(&self) -> &BTreeSet<String> {
        &self.original_expected_files
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Transitions the job to `to`, returning the previous status.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidTransition`] when `to` is not reachable
    /// from the current status.
    pub fn set_status(&self, to: JobStatus) -> Result<JobStatus, JobError> {
        let mut status = self
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let from = *status;
        if !from.can_transition_to(to) {
            return Err(JobError::InvalidTransition { from, to });
        }
        *status = to;
        Ok(from)
    }

    /// Returns the current progress fraction in [0, 1].
    #[must_use]
    pub fn progress(&self) -> f64 {
        *self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `delta` to the progress fraction, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::ProgressOutOfRange`] when the result would leave
    /// [0, 1]; the stored value is unchanged in that case.
    pub fn update_progress(&self, delta: f64) -> Result<f64, JobError> {
        let mut progress = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let next = *progress + delta;
        if !(-PROGRESS_EPSILON..=1.0 + PROGRESS_EPSILON).contains(&next) {
            return Err(JobError::ProgressOutOfRange {
                current: *progress,
                delta,
            });
        }
        *progress = next.clamp(0.0, 1.0);
        Ok(*progress)
    }

    /// Sets the progress fraction to an absolute value in [0, 1].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidProgress`] when `value` is outside [0, 1].
    pub fn set_progress(&self, value: f64) -> Result<(), JobError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(JobError::InvalidProgress(value));
        }
        *self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }

    /// Returns a snapshot of the still-expected file names.
    #[must_use]
    pub fn expected_files(&self) -> BTreeSet<String> {
        self.expected_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes a file from the expected set; returns true if it was present.
    pub fn remove_expected_file(&self, file_name: &str) -> bool {
        self.expected_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(file_name)
    }

    /// Restores a file to the expected set.
    ///
    /// Only files present in the original snapshot are accepted, preserving
    /// `expected_files ⊆ original_expected_files`; returns false otherwise.
    pub fn add_expected_file(&self, file_name: &str) -> bool {
        if !self.original_expected_files.contains(file_name) {
            return false;
        }
        self.expected_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file_name.to_string())
    }

    /// Returns true when no expected files remain.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.expected_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Sets a free-form extra parameter.
    pub fn insert_extra(&self, key: impl Into<String>, value: impl Into<String>) {
        self.extras
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Returns a snapshot of the extras bag.
    #[must_use]
    pub fn extras(&self) -> HashMap<String, String> {
        self.extras
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the serializable projection of the job's current state.
    #[must_use]
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            job_id: self.id.clone(),
            job_name: self.job_name.clone(),
            job_submitter: self.submitter.clone(),
            job_type: self.job_type.clone(),
            job_demands: self.job_demands.clone(),
            local_folder: self.local_folder.clone(),
            watcher_id: self.watcher_id,
            status: self.status(),
            progress: self.progress(),
            expected_files: self.expected_files().into_iter().collect(),
            original_expected_files: self.original_expected_files.iter().cloned().collect(),
            extras: self.extras(),
            created_at: self.created_at,
            completed_at: None,
        }
    }
}

/// Serializable projection of a job, as written to the job store.
///
/// The store copy is write-through and non-live; it becomes authoritative
/// only during startup recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub job_id: JobId,
    /// Human-readable job name.
    pub job_name: String,
    /// Submitter.
    pub job_submitter: String,
    /// Handler registry key.
    pub job_type: String,
    /// Opaque handler parameters.
    pub job_demands: serde_json::Value,
    /// Folder the expected files arrive in.
    pub local_folder: PathBuf,
    /// Spawning watcher, if any.
    pub watcher_id: Option<i64>,
    /// Status at write time.
    pub status: JobStatus,
    /// Progress fraction in [0, 1] at write time.
    pub progress: f64,
    /// File names still expected at write time.
    pub expected_files: Vec<String>,
    /// Immutable snapshot of the originally expected files.
    pub original_expected_files: Vec<String>,
    /// Free-form parameter bag.
    pub extras: HashMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Completion timestamp, set by the store on terminal status updates.
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> JobSpec {
        JobSpec {
            submitter: "tester".to_string(),
            job_type: "maxquant".to_string(),
            job_demands: serde_json::json!({"threads": 4}),
            expected_files: vec!["a.raw".to_string(), "b.raw".to_string()],
            local_folder: PathBuf::from("/tmp/run1"),
            job_name: "run1".to_string(),
            watcher_id: Some(7),
        }
    }

    #[test]
    fn test_new_job_is_waiting() {
        let job = Job::new(test_spec());
        assert_eq!(job.status(), JobStatus::Waiting);
        assert_eq!(job.progress(), 0.0);
        assert_eq!(job.expected_files().len(), 2);
        assert_eq!(job.original_expected_files().len(), 2);
    }

    #[test]
    fn test_job_id_is_time_ordered() {
        let a = JobId::generate();
        let b = JobId::generate();
        // Same-second ids share a prefix; the uuid suffix breaks ties.
        assert_ne!(a, b);
        assert!(a.as_str().contains('_'));
    }

    #[test]
    fn test_valid_lifecycle() {
        let job = Job::new(test_spec());
        job.remove_expected_file("a.raw");
        job.remove_expected_file("b.raw");
        assert!(job.is_ready());

        assert_eq!(job.set_status(JobStatus::Queued).unwrap(), JobStatus::Waiting);
        assert_eq!(job.set_status(JobStatus::Running).unwrap(), JobStatus::Queued);
        assert_eq!(
            job.set_status(JobStatus::Completed).unwrap(),
            JobStatus::Running
        );
    }

    #[test]
    fn test_waiting_to_running_rejected() {
        let job = Job::new(test_spec());
        let err = job.set_status(JobStatus::Running).unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: JobStatus::Waiting,
                to: JobStatus::Running,
            }
        );
        assert_eq!(job.status(), JobStatus::Waiting);
    }

    #[test]
    fn test_progress_increments() {
        let job = Job::new(test_spec());
        job.update_progress(0.3).unwrap();
        job.update_progress(0.3).unwrap();
        job.update_progress(0.3).unwrap();
        assert!((job.progress() - 0.9).abs() < 1e-6);

        // A fourth increment would exceed 1.0 and is rejected.
        assert!(job.update_progress(0.3).is_err());
        assert!((job.progress() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_progress_never_negative() {
        let job = Job::new(test_spec());
        assert!(job.update_progress(-0.1).is_err());
        assert_eq!(job.progress(), 0.0);
    }

    #[test]
    fn test_set_progress_bounds() {
        let job = Job::new(test_spec());
        job.set_progress(0.5).unwrap();
        assert_eq!(job.progress(), 0.5);
        assert!(job.set_progress(1.5).is_err());
        assert!(job.set_progress(-0.1).is_err());
        assert_eq!(job.progress(), 0.5);
    }

    #[test]
    fn test_expected_files_subset_invariant() {
        let job = Job::new(test_spec());
        assert!(job.remove_expected_file("a.raw"));
        assert!(!job.remove_expected_file("a.raw"));
        assert!(job.add_expected_file("a.raw"));
        // Files never in the original snapshot cannot be added.
        assert!(!job.add_expected_file("c.raw"));
        assert!(job.expected_files().contains("a.raw"));
    }

    #[test]
    fn test_record_round_trip() {
        let job = Job::new(test_spec());
        job.remove_expected_file("a.raw");
        job.insert_extra("output", "/tmp/out");
        let record = job.to_record();
        assert_eq!(record.expected_files, vec!["b.raw".to_string()]);
        assert_eq!(record.original_expected_files.len(), 2);

        let rebuilt = Job::from_record(&record);
        assert_eq!(rebuilt.id(), job.id());
        assert_eq!(rebuilt.status(), job.status());
        assert_eq!(rebuilt.expected_files(), job.expected_files());
        assert_eq!(rebuilt.extras().get("output").unwrap(), "/tmp/out");
    }
}
