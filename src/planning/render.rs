use crate::planning::task_types::*;

/// Serializes a plan back into the document format accepted by
/// [`crate::planning::parse_plan`]. Task ids are positional, so the
/// `Task N:` prefix is written back for auto tasks.
pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    out.push_str("---\n");
    out.push_str(&format!("phase: {}\n", plan.phase_id));
    out.push_str(&format!("plan: {}\n", plan.plan_identifier));
    out.push_str("type: execute\n");
    out.push_str("---\n\n");

    out.push_str(&format!("<objective>\n{}\n", plan.objective));
    if !plan.purpose.is_empty() {
        out.push_str(&format!("\nPurpose: {}\n", plan.purpose));
    }
    out.push_str("</objective>\n\n<tasks>\n\n");

    for task in &plan.tasks {
        render_task(&mut out, task);
    }
    out.push_str("</tasks>\n\n");

    render_list(&mut out, "verification", &plan.verification, "- [ ] ");
    render_list(&mut out, "success_criteria", &plan.success_criteria, "- ");
    out
}

fn render_task(out: &mut String, task: &Task) {
    match task {
        Task::Auto(t) => {
            out.push_str("<task type=\"auto\">\n");
            out.push_str(&format!("  <name>Task {}: {}</name>\n", t.id, t.name));
            if !t.target_files.is_empty() {
                out.push_str(&format!("  <files>{}</files>\n", t.target_files.join(", ")));
            }
            out.push_str(&format!("  <action>{}</action>\n", t.action));
            out.push_str(&format!("  <verify>{}</verify>\n", t.verify));
            out.push_str(&format!("  <done>{}</done>\n", t.done));
        }
        Task::CheckpointVerify(t) => {
            out.push_str("<task type=\"checkpoint:human-verify\" gate=\"blocking\">\n");
            out.push_str(&format!("  <name>{}</name>\n", t.name));
            out.push_str(&format!("  <what-built>{}</what-built>\n", t.what_built));
            out.push_str("  <how-to-verify>\n");
            for (i, step) in t.verification_steps.iter().enumerate() {
                out.push_str(&format!("    {}. {}\n", i + 1, step));
            }
            out.push_str("  </how-to-verify>\n");
            out.push_str(&format!("  <resume-signal>{}</resume-signal>\n", t.resume_signal));
        }
        Task::CheckpointDecision(t) => {
            out.push_str("<task type=\"checkpoint:decision\" gate=\"blocking\">\n");
            out.push_str(&format!("  <name>{}</name>\n", t.name));
            out.push_str(&format!("  <decision>{}</decision>\n", t.decision));
            out.push_str(&format!("  <context>{}</context>\n", t.context));
            out.push_str("  <options>\n");
            for o in &t.options {
                out.push_str(&format!("    <option id=\"{}\">\n", o.id));
                out.push_str(&format!("      <name>{}</name>\n", o.name));
                out.push_str(&format!("      <pros>{}</pros>\n", o.pros));
                out.push_str(&format!("      <cons>{}</cons>\n", o.cons));
                out.push_str("    </option>\n");
            }
            out.push_str("  </options>\n");
            out.push_str(&format!("  <resume-signal>{}</resume-signal>\n", t.resume_signal));
        }
    }
    out.push_str("</task>\n\n");
}

fn render_list(out: &mut String, tag: &str, items: &[String], marker: &str) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("<{tag}>\n"));
    for item in items {
        out.push_str(&format!("{marker}{item}\n"));
    }
    out.push_str(&format!("</{tag}>\n\n"));
}
