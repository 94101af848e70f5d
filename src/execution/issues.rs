//! Append-only issue log kept next to the plan.
//!
//! Autonomous runs never stop on a failed task; the failure lands here
//! instead so a later fix-planning pass can pick it up. The format is plain
//! markdown so it reads fine by hand and parses back with [`parse_issues`].

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::info;

pub const OPEN_ISSUES_HEADING: &str = "## Open Issues";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    /// `ISS-NNN`, sequential within one log.
    pub id: String,
    pub severity: Severity,
    pub task_id: usize,
    pub task_name: String,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// `<dir>/<stem>-ISSUES.md` for a plan at `<dir>/<stem>.md`.
pub fn issue_log_path(plan_path: &Path) -> PathBuf {
    let stem = plan_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "PLAN".to_string());
    plan_path.with_file_name(format!("{stem}-ISSUES.md"))
}

pub struct IssueLogger {
    path: PathBuf,
}

impl IssueLogger {
    pub fn for_plan(plan_path: &Path) -> Self {
        Self {
            path: issue_log_path(plan_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> std::io::Result<Vec<IssueRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_issues(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Appends one record and returns it with its assigned id.
    pub fn append(
        &self,
        severity: Severity,
        task_id: usize,
        task_name: &str,
        title: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> std::io::Result<IssueRecord> {
        let existing = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let next = ISSUE_ID
            .captures_iter(&existing)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let record = IssueRecord {
            id: format!("ISS-{next:03}"),
            severity,
            task_id,
            task_name: task_name.to_string(),
            title: title.trim().to_string(),
            description: description.trim().to_string(),
            timestamp: now,
        };
        let rendered = render_record(&record);

        let out = if existing.trim().is_empty() {
            let stem = self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("# Issues: {stem}\n\n{OPEN_ISSUES_HEADING}\n\n{rendered}")
        } else if let Some(start) = existing.find(OPEN_ISSUES_HEADING) {
            // New records go at the end of the open section, before any
            // later `## ` heading.
            let after = start + OPEN_ISSUES_HEADING.len();
            let end = existing[after..]
                .find("\n## ")
                .map(|i| after + i + 1)
                .unwrap_or(existing.len());
            let head = existing[..end].trim_end();
            let tail = &existing[end..];
            if tail.is_empty() {
                format!("{head}\n\n{rendered}")
            } else {
                format!("{head}\n\n{rendered}\n{tail}")
            }
        } else {
            format!(
                "{}\n\n{OPEN_ISSUES_HEADING}\n\n{rendered}",
                existing.trim_end()
            )
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, out)?;
        info!(issue = %record.id, task = task_id, path = %self.path.display(), "issue logged");
        Ok(record)
    }
}

fn render_record(r: &IssueRecord) -> String {
    let mut s = String::new();
    s.push_str(&format!("### {}: {}\n", r.id, r.title));
    s.push_str(&format!("- **Severity:** {}\n", r.severity));
    s.push_str(&format!("- **Task:** {} ({})\n", r.task_id, r.task_name));
    s.push_str(&format!(
        "- **Logged:** {}\n",
        r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    if !r.description.is_empty() {
        s.push('\n');
        for line in r.description.lines() {
            // Keep tool output from opening new headings.
            if line.trim_start().starts_with('#') {
                s.push_str(&format!("    {line}\n"));
            } else {
                s.push_str(&format!("{line}\n"));
            }
        }
    }
    s
}

static ISSUE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^### ISS-(\d+):").expect("issue id"));
static RECORD_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^### (ISS-\d+):\s*(.*)$").expect("issue heading"));
static FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \*\*(Severity|Task|Logged):\*\*\s*(.*)$").expect("issue field"));
static TASK_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*(?:\((.*)\))?$").expect("task field"));

/// Reads records under the open-issues heading. Malformed records are skipped.
pub fn parse_issues(text: &str) -> Vec<IssueRecord> {
    let Some(start) = text.find(OPEN_ISSUES_HEADING) else {
        return Vec::new();
    };
    let body = &text[start + OPEN_ISSUES_HEADING.len()..];

    let mut records = Vec::new();
    let mut current: Option<Draft> = None;
    for line in body.lines() {
        if line.starts_with("## ") {
            break;
        }
        if let Some(caps) = RECORD_HEADING.captures(line) {
            if let Some(done) = current.take().and_then(Draft::finish) {
                records.push(done);
            }
            current = Some(Draft::new(&caps[1], &caps[2]));
            continue;
        }
        let Some(draft) = current.as_mut() else {
            continue;
        };
        if draft.description.is_empty()
            && let Some(caps) = FIELD.captures(line)
        {
            draft.field(&caps[1], caps[2].trim());
            continue;
        }
        draft.description.push(line.strip_prefix("    ").unwrap_or(line).to_string());
    }
    if let Some(done) = current.and_then(Draft::finish) {
        records.push(done);
    }
    records
}

struct Draft {
    id: String,
    title: String,
    severity: Option<Severity>,
    task_id: Option<usize>,
    task_name: String,
    timestamp: Option<DateTime<Utc>>,
    description: Vec<String>,
}

impl Draft {
    fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.trim().to_string(),
            severity: None,
            task_id: None,
            task_name: String::new(),
            timestamp: None,
            description: Vec::new(),
        }
    }

    fn field(&mut self, key: &str, value: &str) {
        match key {
            "Severity" => self.severity = Severity::parse(value),
            "Task" => {
                if let Some(caps) = TASK_FIELD.captures(value) {
                    self.task_id = caps[1].parse().ok();
                    self.task_name = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
                }
            }
            "Logged" => {
                self.timestamp = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            _ => {}
        }
    }

    fn finish(self) -> Option<IssueRecord> {
        Some(IssueRecord {
            id: self.id,
            severity: self.severity?,
            task_id: self.task_id?,
            task_name: self.task_name,
            title: self.title,
            description: self.description.join("\n").trim().to_string(),
            timestamp: self.timestamp?,
        })
    }
}
