//! Goal data model — §3 "Goal".

use serde::{Deserialize, Serialize};

/// Priority class ordering: `critical < high < medium < low`, i.e. critical
/// sorts first (§3 "Priority queue ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl GoalPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            GoalPriority::Critical => "critical",
            GoalPriority::High => "high",
            GoalPriority::Medium => "medium",
            GoalPriority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GoalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GoalStatus::Completed | GoalStatus::Failed | GoalStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub goal_id: String,
    pub title: String,
    pub description: String,
    pub priority: GoalPriority,
    pub status: GoalStatus,
    pub progress: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub derived_learning_job_ids: Vec<String>,
}

impl Goal {
    pub fn new(goal_id: String, title: String, description: String, priority: GoalPriority, metadata: serde_json::Value) -> Self {
        Self {
            goal_id,
            title,
            description,
            priority,
            status: GoalStatus::Pending,
            progress: 0.0,
            metadata,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            derived_learning_job_ids: Vec::new(),
        }
    }

    /// Ordering key for the priority queue: priority class first, then
    /// earlier creation time (§3).
    pub fn queue_key(&self) -> (GoalPriority, chrono::DateTime<chrono::Utc>) {
        (self.priority, self.created_at)
    }
}
