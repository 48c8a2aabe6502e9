//! Parsing of the task table: row detection, status vocabulary, classification

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Discrete state derived from the task table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestrationState {
    WorkLeft,
    InReview,
    Blocked,
    Done,
    /// The state artifact does not exist
    NoState,
}

impl OrchestrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkLeft => "work-left",
            Self::InReview => "in-review",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::NoState => "no-state",
        }
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status vocabulary of a task row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    InReview,
    Blocked,
    Complete,
}

impl TaskStatus {
    /// Parse a table cell; case and surrounding whitespace are ignored
    pub fn parse(cell: &str) -> Option<Self> {
        match cell.trim().to_uppercase().as_str() {
            "NOT STARTED" => Some(Self::NotStarted),
            "IN PROGRESS" => Some(Self::InProgress),
            "IN_REVIEW" | "IN REVIEW" => Some(Self::InReview),
            "BLOCKED" => Some(Self::Blocked),
            "COMPLETE" | "COMPLETED" | "DONE" => Some(Self::Complete),
            _ => None,
        }
    }

    /// Statuses a worker can pick up right now
    pub fn is_actionable(self) -> bool {
        matches!(self, Self::InProgress | Self::NotStarted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT STARTED",
            Self::InProgress => "IN PROGRESS",
            Self::InReview => "IN REVIEW",
            Self::Blocked => "BLOCKED",
            Self::Complete => "COMPLETE",
        }
    }
}

/// Aggregate counts over recognised task rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    /// Not started plus in progress
    pub remaining: usize,
    pub in_review: usize,
    pub blocked: usize,
}

/// One recognised task row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    /// 1-based line number in the artifact
    pub line: usize,
}

/// Cells scanned for a status; the table may carry an optional extra column
const STATUS_CELLS: std::ops::RangeInclusive<usize> = 3..=5;

static TASK_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\|\s*([A-Za-z][A-Za-z0-9_]*-\d+(?:\.\d+)*|\d+(?:\.\d+)*)\s*\|").expect("task row regex")
});
static BLOCKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\|\s*BLOCKED\s*\|").expect("blocked regex"));
static IN_REVIEW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\|\s*IN[_ ]REVIEW\s*\|").expect("in-review regex"));
static INCOMPLETE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)\|\s*(?:NOT STARTED|IN PROGRESS)\s*\|").expect("incomplete regex"));

/// Classify the whole artifact. Priority: blocked, in review, incomplete, done.
pub fn classify(content: &str) -> OrchestrationState {
    if BLOCKED.is_match(content) {
        OrchestrationState::Blocked
    } else if IN_REVIEW.is_match(content) {
        OrchestrationState::InReview
    } else if INCOMPLETE.is_match(content) {
        OrchestrationState::WorkLeft
    } else {
        OrchestrationState::Done
    }
}

/// Parse one line as a task row. `line_no` is 1-based.
///
/// Lines that look like rows but carry no recognised status in the scanned
/// cells (e.g. a different table) yield `None`.
pub fn parse_row(line: &str, line_no: usize) -> Option<TaskRow> {
    let id = TASK_ROW.captures(line)?.get(1)?.as_str().to_string();
    let cells: Vec<&str> = line.split('|').collect();
    let status = STATUS_CELLS
        .filter_map(|i| cells.get(i))
        .find_map(|cell| TaskStatus::parse(cell))?;
    let title = cells.get(2).map(|c| c.trim().to_string()).unwrap_or_default();
    Some(TaskRow {
        id,
        title,
        status,
        line: line_no,
    })
}

/// All recognised rows in file order
pub fn task_rows(lines: &[String]) -> Vec<TaskRow> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(i, line)| parse_row(line, i + 1))
        .collect()
}

pub fn stats(rows: &[TaskRow]) -> TaskStats {
    let mut stats = TaskStats::default();
    for row in rows {
        stats.total += 1;
        match row.status {
            TaskStatus::Complete => stats.completed += 1,
            TaskStatus::NotStarted | TaskStatus::InProgress => stats.remaining += 1,
            TaskStatus::InReview => stats.in_review += 1,
            TaskStatus::Blocked => stats.blocked += 1,
        }
    }
    stats
}

/// First actionable row in file order
pub fn active_item(rows: &[TaskRow]) -> Option<&TaskRow> {
    rows.iter().find(|row| row.status.is_actionable())
}
