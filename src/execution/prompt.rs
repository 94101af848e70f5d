use crate::planning::{AutoTask, ExecutionPlan, Task};
use std::collections::BTreeMap;

/// System message shared by every task of a plan.
pub fn system_prompt(plan: &ExecutionPlan, decisions: &BTreeMap<usize, String>) -> String {
    let mut s = String::new();
    s.push_str(&format!(
        "You are executing a plan for phase {} (plan {}), one task at a time.\n",
        plan.phase_id, plan.plan_identifier
    ));
    s.push_str(&format!("\nObjective:\n{}\n", plan.objective));
    if !plan.purpose.is_empty() {
        s.push_str(&format!("\nPurpose: {}\n", plan.purpose));
    }

    if !decisions.is_empty() {
        s.push_str("\nDecisions already made:\n");
        for (task_id, option_id) in decisions {
            let label = plan
                .task(task_id.saturating_sub(1))
                .and_then(|t| match t {
                    Task::CheckpointDecision(d) => Some((d.decision.as_str(), d.option(option_id))),
                    _ => None,
                })
                .map(|(q, opt)| match opt {
                    Some(o) => format!("{q} -> {} ({})", o.name, o.id),
                    None => format!("{q} -> {option_id}"),
                })
                .unwrap_or_else(|| format!("task {task_id} -> {option_id}"));
            s.push_str(&format!("- {label}\n"));
        }
    }

    s.push_str(
        "\nDo the work by calling the provided tools. Describing changes without making \
         them does not count. Run the verification yourself and stop calling tools once \
         the done criteria hold.\n",
    );
    s
}

/// User message for one auto task, with any stashed user context appended.
pub fn task_prompt(task: &AutoTask, context: Option<&str>) -> String {
    let mut s = String::new();
    s.push_str(&format!("Task {}: {}\n", task.id, task.name));
    if !task.target_files.is_empty() {
        s.push_str(&format!("\nFiles: {}\n", task.target_files.join(", ")));
    }
    if !task.action.is_empty() {
        s.push_str(&format!("\nAction:\n{}\n", task.action));
    }
    if !task.verify.is_empty() {
        s.push_str(&format!("\nVerify:\n{}\n", task.verify));
    }
    if !task.done.is_empty() {
        s.push_str(&format!("\nDone when:\n{}\n", task.done));
    }
    if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
        s.push_str(&format!("\nAdditional context from the user:\n{ctx}\n"));
    }
    s
}

/// Mid-task message carrying text stashed while the task was running.
pub fn injected_context(text: &str) -> String {
    format!("Additional context from the user (apply it to the current task):\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::parse_plan;

    const PLAN: &str = r#"phase: 05-api
plan: 01
<objective>
Ship the API.
Purpose: clients need it.
</objective>
<tasks>
<task type="checkpoint:decision">
  <decision>Framework?</decision>
  <options><option id="axum"><name>Axum</name></option></options>
</task>
<task type="auto">
  <name>Task 2: Add routes</name>
  <files>src/routes.rs</files>
  <action>Add GET /health.</action>
  <verify>cargo test</verify>
  <done>health returns 200</done>
</task>
</tasks>"#;

    #[test]
    fn task_prompt_includes_fields_and_context() {
        let plan = parse_plan(PLAN).unwrap();
        let Task::Auto(task) = &plan.tasks[1] else {
            panic!("expected auto task");
        };
        let p = task_prompt(task, Some("use retries=5"));
        assert!(p.starts_with("Task 2: Add routes"));
        assert!(p.contains("Files: src/routes.rs"));
        assert!(p.contains("Done when:\nhealth returns 200"));
        assert!(p.contains("Additional context from the user:\nuse retries=5"));

        assert!(!task_prompt(task, None).contains("Additional context"));
    }

    #[test]
    fn system_prompt_lists_decisions() {
        let plan = parse_plan(PLAN).unwrap();
        let decisions = BTreeMap::from([(1usize, "axum".to_string())]);
        let p = system_prompt(&plan, &decisions);
        assert!(p.contains("phase 05-api"));
        assert!(p.contains("Purpose: clients need it."));
        assert!(p.contains("- Framework? -> Axum (axum)"));
    }
}
