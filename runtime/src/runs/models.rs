use std::fmt;
use std::path::PathBuf;

use capsules_stack::Detection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cleanup::CleanupReport;
use crate::error::ErrorBody;

/// Externally visible run state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Building,
    Running,
    Stopped,
    Error,
}

/// Lifecycle stage driven by the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Created,
    Extracting,
    Detecting,
    Generating,
    Building,
    Allocating,
    Launching,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Created => "created",
            RunStage::Extracting => "extracting",
            RunStage::Detecting => "detecting",
            RunStage::Generating => "generating",
            RunStage::Building => "building",
            RunStage::Allocating => "allocating",
            RunStage::Launching => "launching",
            RunStage::Running => "running",
            RunStage::Stopping => "stopping",
            RunStage::Stopped => "stopped",
            RunStage::Failed => "failed",
        }
    }

    pub fn is_pre_running(&self) -> bool {
        matches!(
            self,
            RunStage::Created
                | RunStage::Extracting
                | RunStage::Detecting
                | RunStage::Generating
                | RunStage::Building
                | RunStage::Allocating
                | RunStage::Launching
        )
    }

    fn successor(&self) -> Option<RunStage> {
        match self {
            RunStage::Created => Some(RunStage::Extracting),
            RunStage::Extracting => Some(RunStage::Detecting),
            RunStage::Detecting => Some(RunStage::Generating),
            RunStage::Generating => Some(RunStage::Building),
            RunStage::Building => Some(RunStage::Allocating),
            RunStage::Allocating => Some(RunStage::Launching),
            RunStage::Launching => Some(RunStage::Running),
            RunStage::Running | RunStage::Stopping => Some(RunStage::Stopped),
            RunStage::Stopped | RunStage::Failed => None,
        }
    }

    pub fn can_transition_to(&self, next: RunStage) -> bool {
        if self.successor() == Some(next) {
            return true;
        }
        match next {
            RunStage::Failed => self.is_pre_running(),
            RunStage::Stopping => self.is_pre_running() || *self == RunStage::Running,
            _ => false,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunStage::Running => RunStatus::Running,
            RunStage::Stopping | RunStage::Stopped => RunStatus::Stopped,
            RunStage::Failed => RunStatus::Error,
            _ => RunStatus::Building,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub workspace: PathBuf,
    pub image_tag: String,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub detected_stack: Option<Detection>,
    pub stage: RunStage,
    pub status: RunStatus,
    #[serde(with = "serde_rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "serde_rfc3339")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, workspace: PathBuf, image_tag: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workspace,
            image_tag: image_tag.into(),
            container_id: None,
            host_port: None,
            container_port: None,
            detected_stack: None,
            stage: RunStage::Created,
            status: RunStatus::Building,
            created_at: now,
            updated_at: now,
            exit_code: None,
            error: None,
        }
    }

    /// Moves to `next` if the lifecycle graph allows it; status follows the
    /// stage.
    pub fn advance(&mut self, next: RunStage) -> bool {
        if !self.stage.can_transition_to(next) {
            return false;
        }
        self.stage = next;
        self.status = next.status();
        self.touch();
        true
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.run_id.clone(),
            status: self.status,
            stage: self.stage,
            host_port: self.host_port,
            container_id: self.container_id.clone(),
            detected_stack: self.detected_stack.clone(),
            created_at: self.created_at,
            exit_code: self.exit_code,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
    pub run_id: String,
    pub status: RunStatus,
    pub stage: RunStage,
    pub host_port: Option<u16>,
    pub container_id: Option<String>,
    pub detected_stack: Option<Detection>,
    #[serde(with = "serde_rfc3339")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What an upload returns. `run_id` and `log_channel` are always set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunResponse {
    pub run_id: String,
    pub log_channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl CreateRunResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAck {
    pub run_id: String,
    pub stopped: bool,
    pub cleanup: CleanupReport,
}

mod serde_rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
