//! Print jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{color::Rgb, printer::Serial};

/// A job's identifier, assigned by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Display, FromStr,
)]
#[serde(transparent)]
#[display("{0}")]
pub struct JobId(pub u64);

/// Where a job is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a printer.
    Pending,
    /// Bound to a printer, file on its way.
    Uploading,
    /// On the printer.
    Printing,
    /// Printed.
    Finished,
    /// Gave up.
    Failed,
}

impl JobStatus {
    /// Finished or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

/// One filament the job needs, in the order the job's file uses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Requirement {
    /// Material type, compared case-insensitively.
    pub material: String,
    /// Wanted color.
    pub color: Rgb,
}

/// Flags that steer how the job is handled after binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobMetadata {
    /// The job must run unattended, back to back with others.
    #[serde(default)]
    pub continuous: bool,
    /// Height of the printed part, used by the clearing safety guard.
    #[serde(default)]
    pub part_height_mm: Option<f64>,
    /// Anything else the submitter attached.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A job as submitted, before the store has given it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NewJob {
    /// Filaments needed.
    pub requirements: Vec<Requirement>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Handling flags.
    #[serde(default)]
    pub metadata: JobMetadata,
}

/// A print job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// The id.
    pub id: JobId,
    /// Filaments needed.
    pub requirements: Vec<Requirement>,
    /// Higher runs first.
    pub priority: i32,
    /// Lifecycle state.
    pub status: JobStatus,
    /// The printer it is bound to.
    pub assigned_printer: Option<Serial>,
    /// Why it failed.
    pub error_reason: Option<String>,
    /// Handling flags.
    pub metadata: JobMetadata,
    /// When it was submitted.
    pub created_at: DateTime<Utc>,
    /// When it last changed.
    pub updated_at: DateTime<Utc>,
    /// When it reached `FINISHED` or `FAILED`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a pending job from a submission.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            requirements: new.requirements,
            priority: new.priority,
            status: JobStatus::Pending,
            assigned_printer: None,
            error_reason: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `FAILED`, keeping the reason.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_reason = Some(reason.into());
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Move to `FINISHED`.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Finished;
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

/// Which jobs [`crate::fleet::Fleet::list_jobs`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobFilter {
    /// Only jobs in this state.
    pub status: Option<JobStatus>,
}

impl JobFilter {
    /// Whether `job` passes the filter.
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;

    #[test]
    fn test_metadata_keeps_unknown_fields() -> TestResult {
        let metadata: JobMetadata = serde_json::from_str(
            r#"{"continuous": true, "part_height_mm": 62.5, "sku": "ZYL-01"}"#,
        )?;
        assert!(metadata.continuous);
        assert_eq!(metadata.part_height_mm, Some(62.5));
        assert_eq!(metadata.extra["sku"], "ZYL-01");
        Ok(())
    }

    #[test]
    fn test_new_job_defaults() -> TestResult {
        let new: NewJob = serde_json::from_str(r##"{"requirements": [{"material": "PLA", "color": "#FFFFFF"}]}"##)?;
        let job = Job::from_new(JobId(4), new, Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 0);
        assert_eq!(job.assigned_printer, None);
        assert!(!job.metadata.continuous);
        Ok(())
    }

    #[test]
    fn test_filter() -> TestResult {
        let new: NewJob = serde_json::from_str(r#"{"requirements": []}"#)?;
        let mut job = Job::from_new(JobId(1), new, Utc::now());
        let pending = JobFilter {
            status: Some(JobStatus::Pending),
        };
        assert!(pending.matches(&job));
        job.fail("nope", Utc::now());
        assert!(!pending.matches(&job));
        assert!(JobFilter::default().matches(&job));
        Ok(())
    }
}
