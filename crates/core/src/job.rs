//! Job kind and canonical state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Media kind of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Photo,
    Video,
    Audio,
}

impl JobKind {
    /// Typical wall-clock duration for one generation of this kind.
    ///
    /// Used only for progress estimation and ETA display; real completion is
    /// decided by provider observations.
    pub fn expected_duration(&self) -> Duration {
        match self {
            JobKind::Photo => Duration::from_secs(30),
            JobKind::Video => Duration::from_secs(90),
            JobKind::Audio => Duration::from_secs(45),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Photo => "photo",
            JobKind::Video => "video",
            JobKind::Audio => "audio",
        }
    }
}

impl core::str::FromStr for JobKind {
    type Err = GenerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "photo" | "image" => Ok(JobKind::Photo),
            "video" => Ok(JobKind::Video),
            "audio" => Ok(JobKind::Audio),
            other => Err(GenerationError::validation(format!(
                "kind must be one of photo, video, audio (got {other})"
            ))),
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-agnostic job status.
///
/// `Success` and `Failed` are terminal: once reached, the job is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Success,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Success => "success",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn kind_parses_image_alias() {
        assert_eq!(JobKind::from_str("image").unwrap(), JobKind::Photo);
        assert_eq!(JobKind::from_str("VIDEO").unwrap(), JobKind::Video);
        assert!(JobKind::from_str("music").is_err());
    }
}
