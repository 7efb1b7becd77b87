//! Habit-log domain types and their cache keys.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cacheable, QueryKey};
use crate::sync::Mutation;

/// Remote table holding habit logs.
pub const HABIT_LOGS_RESOURCE: &str = "habit_logs";

/// A habit completion the user wants recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHabitLog {
  pub habit_id: String,
  pub user_id: String,
  pub logged_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// A habit log row as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitLog {
  pub id: String,
  pub habit_id: String,
  #[serde(default)]
  pub user_id: String,
  pub logged_at: DateTime<Utc>,
  #[serde(default)]
  pub value: Option<i64>,
  #[serde(default)]
  pub notes: Option<String>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl Cacheable for HabitLog {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.updated_at
  }

  fn entity_type() -> &'static str {
    "habit_log"
  }
}

impl Mutation for NewHabitLog {
  type Record = HabitLog;

  fn resource_type(&self) -> &str {
    HABIT_LOGS_RESOURCE
  }

  /// A new log shows up under the day it was logged for.
  fn query_key(&self) -> QueryKey {
    HabitQueryKey::HabitLogsByDate {
      date: self.logged_at.date_naive(),
    }
    .key()
  }

  fn placeholder(&self, local_id: &str, created_at: DateTime<Utc>) -> HabitLog {
    HabitLog {
      id: local_id.to_string(),
      habit_id: self.habit_id.clone(),
      user_id: self.user_id.clone(),
      logged_at: self.logged_at,
      value: self.value,
      notes: self.notes.clone(),
      created_at: Some(created_at),
      updated_at: Some(created_at),
    }
  }

  fn describe(&self) -> String {
    match self.value {
      Some(value) => format!(
        "Log habit {} (value {}) for {}",
        self.habit_id,
        value,
        self.logged_at.date_naive()
      ),
      None => format!("Log habit {} for {}", self.habit_id, self.logged_at.date_naive()),
    }
  }
}

/// Query keys for habit-tracking data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HabitQueryKey {
  /// Everything habit related
  All,
  Goals,
  HabitLogs,
  HabitLogsByDate { date: NaiveDate },
}

impl HabitQueryKey {
  pub fn key(&self) -> QueryKey {
    let all = QueryKey::new(["habits"]);
    match self {
      Self::All => all,
      Self::Goals => all.child("goals"),
      Self::HabitLogs => all.child("habit-logs"),
      Self::HabitLogsByDate { date } => all
        .child("habit-logs")
        .child("by-date")
        .child(date.format("%Y-%m-%d").to_string()),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::All => "all habit data".to_string(),
      Self::Goals => "goals".to_string(),
      Self::HabitLogs => "habit logs".to_string(),
      Self::HabitLogsByDate { date } => format!("habit logs for {}", date),
    }
  }
}

impl From<HabitQueryKey> for QueryKey {
  fn from(key: HabitQueryKey) -> Self {
    key.key()
  }
}
