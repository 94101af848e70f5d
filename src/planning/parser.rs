//! Plan document parsing.
//!
//! A plan is a `key: value` frontmatter block followed by tagged sections:
//! `<objective>`, `<tasks>`, `<verification>` and `<success_criteria>`.
//! Parsing is all-or-nothing; a document without a phase id, an objective or
//! at least one task is rejected.

use crate::planning::task_types::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanParseError {
    #[error("plan is missing a phase id (frontmatter `phase:`)")]
    MissingPhase,
    #[error("plan is missing an <objective> section")]
    MissingObjective,
    #[error("plan has no tasks")]
    NoTasks,
    #[error("failed to read plan {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<task\b([^>]*)>(.*?)</task>"#).expect("task regex"));
static OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<option\b([^>]*)>(.*?)</option>"#).expect("option regex"));
static OPTIONS_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<options\b.*?</options>"#).expect("options regex"));
static TASK_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^task\s+\d+[a-z]?\s*:\s*").expect("prefix regex"));
static STEP_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s*[.)]\s*").expect("step regex"));
static LIST_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]\s*)?(?:\[[ xX]?\]\s*)?").expect("list regex"));

pub fn parse_plan_file(path: &Path) -> Result<ExecutionPlan, PlanParseError> {
    let text = std::fs::read_to_string(path).map_err(|e| PlanParseError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_plan(&text)
}

pub fn parse_plan(text: &str) -> Result<ExecutionPlan, PlanParseError> {
    let (frontmatter, body) = split_frontmatter(text);

    let phase_id = frontmatter
        .get("phase")
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(PlanParseError::MissingPhase)?;
    let plan_identifier = frontmatter.get("plan").cloned().unwrap_or_default();

    let objective_raw = tag_content(body, "objective")
        .filter(|s| !s.is_empty())
        .ok_or(PlanParseError::MissingObjective)?;
    let (objective, purpose) = split_purpose(&objective_raw);
    if objective.is_empty() {
        return Err(PlanParseError::MissingObjective);
    }

    let tasks_section = tag_content(body, "tasks").unwrap_or_default();
    let tasks: Vec<Task> = TASK_RE
        .captures_iter(&tasks_section)
        .enumerate()
        .map(|(i, caps)| {
            let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            parse_task(i + 1, attrs, inner)
        })
        .collect();
    if tasks.is_empty() {
        return Err(PlanParseError::NoTasks);
    }

    let verification = tag_content(body, "verification")
        .map(|s| list_items(&s))
        .unwrap_or_default();
    let success_criteria = tag_content(body, "success_criteria")
        .map(|s| list_items(&s))
        .unwrap_or_default();

    debug!(
        phase = %phase_id,
        plan = %plan_identifier,
        tasks = tasks.len(),
        "parsed plan"
    );

    Ok(ExecutionPlan {
        phase_id,
        plan_identifier,
        objective,
        purpose,
        tasks,
        verification,
        success_criteria,
    })
}

/// Splits leading `key: value` lines from the body. Accepts both a
/// `---`-delimited block and bare lines up to the first blank or tag line.
fn split_frontmatter(text: &str) -> (BTreeMap<String, String>, &str) {
    let mut map = BTreeMap::new();
    let trimmed = text.trim_start_matches('\u{feff}');

    let (block, body) = if let Some(rest) = trimmed.trim_start().strip_prefix("---") {
        match rest.find("\n---") {
            Some(end) => {
                let after = &rest[end + 4..];
                let body = after.split_once('\n').map(|(_, b)| b).unwrap_or("");
                (&rest[..end], body)
            }
            None => ("", trimmed),
        }
    } else {
        let mut offset = 0;
        for line in trimmed.split_inclusive('\n') {
            let l = line.trim();
            if l.is_empty() || l.starts_with('<') || !l.contains(':') {
                break;
            }
            offset += line.len();
        }
        (&trimmed[..offset], &trimmed[offset..])
    };

    for line in block.lines() {
        if let Some((k, v)) = line.split_once(':') {
            let key = k.trim();
            if key.is_empty() {
                continue;
            }
            let value = v.trim().trim_matches('"').trim_matches('\'').to_string();
            map.insert(key.to_string(), value);
        }
    }
    (map, body)
}

fn split_purpose(objective: &str) -> (String, String) {
    let mut kept = Vec::new();
    let mut purpose = String::new();
    for line in objective.lines() {
        if let Some(rest) = line.trim().strip_prefix("Purpose:") {
            purpose = rest.trim().to_string();
        } else {
            kept.push(line);
        }
    }
    (kept.join("\n").trim().to_string(), purpose)
}

fn parse_task(id: usize, attrs: &str, inner: &str) -> Task {
    let kind = attr_value(attrs, "type").unwrap_or_default();
    // Option blocks carry their own <name> tags.
    let outer = OPTIONS_BLOCK_RE.replace_all(inner, "");
    let name_tag = tag_content(&outer, "name").map(|n| strip_task_prefix(&n));
    let resume_signal = tag_content(inner, "resume-signal").unwrap_or_default();

    match kind.as_str() {
        "checkpoint:human-verify" => Task::CheckpointVerify(CheckpointVerifyTask {
            id,
            name: name_tag.unwrap_or_else(|| "Human verification".to_string()),
            what_built: tag_content(inner, "what-built").unwrap_or_default(),
            verification_steps: verification_steps(
                &tag_content(inner, "how-to-verify").unwrap_or_default(),
            ),
            resume_signal,
            status: TaskStatus::Pending,
        }),
        "checkpoint:decision" => {
            let decision = tag_content(inner, "decision").unwrap_or_default();
            let options = tag_content(inner, "options")
                .map(|o| parse_options(&o))
                .unwrap_or_default();
            Task::CheckpointDecision(CheckpointDecisionTask {
                id,
                name: name_tag.unwrap_or_else(|| decision.clone()),
                decision,
                context: tag_content(inner, "context").unwrap_or_default(),
                options,
                resume_signal,
                status: TaskStatus::Pending,
            })
        }
        other => {
            if other != "auto" {
                debug!(task = id, kind = other, "unknown task type, treating as auto");
            }
            Task::Auto(AutoTask {
                id,
                name: name_tag.unwrap_or_else(|| format!("Task {id}")),
                target_files: tag_content(inner, "files")
                    .map(|f| target_files(&f))
                    .unwrap_or_default(),
                action: tag_content(inner, "action").unwrap_or_default(),
                verify: tag_content(inner, "verify").unwrap_or_default(),
                done: tag_content(inner, "done").unwrap_or_default(),
                status: TaskStatus::Pending,
            })
        }
    }
}

fn parse_options(section: &str) -> Vec<DecisionOption> {
    OPTION_RE
        .captures_iter(section)
        .enumerate()
        .map(|(i, caps)| {
            let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let id = attr_value(attrs, "id")
                .or_else(|| tag_content(inner, "id"))
                .unwrap_or_else(|| format!("option-{}", i + 1));
            DecisionOption {
                name: tag_content(inner, "name").unwrap_or_else(|| id.clone()),
                pros: tag_content(inner, "pros").unwrap_or_default(),
                cons: tag_content(inner, "cons").unwrap_or_default(),
                id,
            }
        })
        .collect()
}

fn strip_task_prefix(name: &str) -> String {
    TASK_PREFIX_RE.replace(name.trim(), "").trim().to_string()
}

fn target_files(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty() && !is_placeholder(f))
        .map(str::to_string)
        .collect()
}

fn is_placeholder(token: &str) -> bool {
    (token.starts_with('[') && token.ends_with(']'))
        || (token.starts_with('{') && token.ends_with('}'))
}

fn verification_steps(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| STEP_MARKER_RE.replace(l.trim(), "").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn list_items(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| LIST_MARKER_RE.replace(l.trim(), "").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Trimmed inner text of the first `<tag ...>...</tag>` in `text`.
pub(crate) fn tag_content(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{0}(?:\s[^>]*)?>(.*?)</{0}>", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| dedent(m.as_str()))
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let pattern = format!(r#"\b{}\s*=\s*"([^"]*)""#, regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(attrs)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn dedent(s: &str) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
