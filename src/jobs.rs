use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Kind of external document an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DocType {
    Law,
    Judgment,
    Qa,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Law => "law",
            DocType::Judgment => "judgment",
            DocType::Qa => "qa",
        }
    }

    pub const ALL: [DocType; 3] = [DocType::Law, DocType::Judgment, DocType::Qa];
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "law" => Ok(DocType::Law),
            "judgment" => Ok(DocType::Judgment),
            "qa" => Ok(DocType::Qa),
            other => anyhow::bail!("unknown document type '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    /// Held in memory by a worker between claim and outcome; never written.
    Processing,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => anyhow::bail!("unknown job status '{}'", other),
        }
    }
}

/// One fetch job per (external id, document type).
#[derive(Debug, Clone)]
pub struct Job {
    pub doc_id: String,
    pub doc_type: DocType,
    pub status: JobStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error_log: Option<String>,
}

/// Result of one fetch attempt, as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

/// Column values a single outcome write must leave behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: JobStatus,
    pub retry_count: u32,
    pub error_log: Option<String>,
}

impl Job {
    /// True when the job must not be attempted again: fetched already, or
    /// failed with its retries used up.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        match self.status {
            JobStatus::Success => true,
            JobStatus::Failed => self.retry_count >= max_retries,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }

    /// Next state for this job given the outcome of one attempt.
    pub fn apply(&self, outcome: &Outcome, max_retries: u32, max_error_chars: usize) -> Transition {
        match outcome {
            Outcome::Success => Transition {
                status: JobStatus::Success,
                retry_count: 0,
                error_log: None,
            },
            Outcome::Failure(message) => {
                let retry_count = self.retry_count.saturating_add(1);
                let status = if retry_count >= max_retries {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                };
                Transition {
                    status,
                    retry_count,
                    error_log: Some(truncate_chars(message, max_error_chars)),
                }
            }
        }
    }
}

/// Cut `s` to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, retry_count: u32) -> Job {
        Job {
            doc_id: "12345".into(),
            doc_type: DocType::Law,
            status,
            retry_count,
            created_at: Utc::now(),
            last_attempt: None,
            error_log: None,
        }
    }

    #[test]
    fn success_resets_retries_and_clears_error() {
        let mut j = job(JobStatus::Pending, 2);
        j.error_log = Some("timeout".into());
        let t = j.apply(&Outcome::Success, 3, 500);
        assert_eq!(t.status, JobStatus::Success);
        assert_eq!(t.retry_count, 0);
        assert_eq!(t.error_log, None);
    }

    #[test]
    fn failure_increments_by_one_until_exhausted() {
        let outcome = Outcome::Failure("HTTP 503".into());
        let t1 = job(JobStatus::Pending, 0).apply(&outcome, 3, 500);
        assert_eq!((t1.status, t1.retry_count), (JobStatus::Pending, 1));

        let t2 = job(JobStatus::Pending, 1).apply(&outcome, 3, 500);
        assert_eq!((t2.status, t2.retry_count), (JobStatus::Pending, 2));

        let t3 = job(JobStatus::Pending, 2).apply(&outcome, 3, 500);
        assert_eq!((t3.status, t3.retry_count), (JobStatus::Failed, 3));
        assert_eq!(t3.error_log.as_deref(), Some("HTTP 503"));
    }

    #[test]
    fn failed_status_implies_exhausted_retries() {
        for max in 1..6 {
            let mut j = job(JobStatus::Pending, 0);
            loop {
                let t = j.apply(&Outcome::Failure("x".into()), max, 500);
                if t.status == JobStatus::Failed {
                    assert!(t.retry_count >= max);
                    break;
                }
                assert!(t.retry_count > j.retry_count);
                j.retry_count = t.retry_count;
                j.status = t.status;
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(job(JobStatus::Success, 0).is_terminal(3));
        assert!(job(JobStatus::Failed, 3).is_terminal(3));
        assert!(!job(JobStatus::Failed, 1).is_terminal(3));
        assert!(!job(JobStatus::Pending, 2).is_terminal(3));
    }

    #[test]
    fn error_text_truncated_on_char_boundary() {
        let msg = "Lỗi kết nối ".repeat(100);
        let t = job(JobStatus::Pending, 0).apply(&Outcome::Failure(msg), 3, 500);
        assert_eq!(t.error_log.unwrap().chars().count(), 500);
        assert_eq!(truncate_chars("Điều", 2), "Đi");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[test]
    fn enum_round_trip_through_strings() {
        for t in DocType::ALL {
            assert_eq!(t.as_str().parse::<DocType>().unwrap(), t);
        }
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
    }
}
