//! Objective-file markdown format (§6 "Objective file format", R1).
//!
//! `## <id> — <title>` heading, metadata lines, then `### Description`,
//! `### Success Criteria`, `### Dimensional Profile`, `### Tasks`
//! subsections. One file holds every objective at a given level
//! (`PRIMARY_OBJECTIVES.md` etc.).

use crate::errors::FatalStateError;
use crate::state::types::{DimensionalProfile, ObjectiveRecord, Priority, SuccessCriterion};

/// Render every objective at one level into the file's full markdown body.
pub fn render_objectives(objectives: &[ObjectiveRecord]) -> String {
    let mut out = String::new();
    for (i, objective) in objectives.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&render_one(objective));
    }
    out
}

fn render_one(objective: &ObjectiveRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("## {} — {}\n", objective.id, objective.title));
    out.push_str(&format!("status: {}\n", objective.status));
    out.push_str(&format!("priority: {}\n", priority_str(objective.priority)));
    out.push_str(&format!("dependencies: {}\n", objective.dependencies.join(", ")));
    out.push('\n');

    out.push_str("### Description\n");
    out.push_str(objective.description.trim_end());
    out.push_str("\n\n");

    out.push_str("### Success Criteria\n");
    for criterion in &objective.success_criteria {
        let mark = if criterion.done { "x" } else { " " };
        out.push_str(&format!("- [{mark}] {}\n", criterion.text));
    }
    out.push('\n');

    let p = &objective.dimensional_profile;
    out.push_str("### Dimensional Profile\n");
    out.push_str(&format!("- temporal: {}\n", p.temporal));
    out.push_str(&format!("- functional: {}\n", p.functional));
    out.push_str(&format!("- data: {}\n", p.data));
    out.push_str(&format!("- state: {}\n", p.state));
    out.push_str(&format!("- error: {}\n", p.error));
    out.push_str(&format!("- context: {}\n", p.context));
    out.push_str(&format!("- integration: {}\n", p.integration));
    out.push('\n');

    out.push_str("### Tasks\n");
    for task_id in &objective.tasks {
        out.push_str(&format!("- {task_id}\n"));
    }

    out
}

fn priority_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "CRITICAL",
        Priority::High => "HIGH",
        Priority::Normal => "NORMAL",
        Priority::Low => "LOW",
    }
}

fn parse_priority(raw: &str) -> Priority {
    match raw.trim().to_uppercase().as_str() {
        "CRITICAL" => Priority::Critical,
        "HIGH" => Priority::High,
        "LOW" => Priority::Low,
        _ => Priority::Normal,
    }
}

/// Parse every objective out of one level's markdown file body.
pub fn parse_objectives(raw: &str) -> Result<Vec<ObjectiveRecord>, FatalStateError> {
    let mut objectives = Vec::new();
    let mut lines = raw.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(heading) = line.strip_prefix("## ") else {
            continue;
        };
        let (id, title) = split_heading(heading);
        let mut status = String::new();
        let mut priority = Priority::Normal;
        let mut dependencies = Vec::new();
        let mut description = String::new();
        let mut success_criteria = Vec::new();
        let mut profile = DimensionalProfile::default();
        let mut tasks = Vec::new();

        #[derive(PartialEq)]
        enum Section {
            Metadata,
            Description,
            SuccessCriteria,
            DimensionalProfile,
            Tasks,
            None,
        }
        let mut section = Section::Metadata;

        while let Some(&next) = lines.peek() {
            if next.starts_with("## ") {
                break;
            }
            let next = lines.next().unwrap();

            if let Some(rest) = next.strip_prefix("### ") {
                section = match rest.trim() {
                    "Description" => Section::Description,
                    "Success Criteria" => Section::SuccessCriteria,
                    "Dimensional Profile" => Section::DimensionalProfile,
                    "Tasks" => Section::Tasks,
                    _ => Section::None,
                };
                continue;
            }

            match section {
                Section::Metadata => {
                    if let Some(rest) = next.strip_prefix("status:") {
                        status = rest.trim().to_string();
                    } else if let Some(rest) = next.strip_prefix("priority:") {
                        priority = parse_priority(rest);
                    } else if let Some(rest) = next.strip_prefix("dependencies:") {
                        dependencies = rest
                            .split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect();
                    }
                }
                Section::Description => {
                    if !description.is_empty() {
                        description.push('\n');
                    }
                    description.push_str(next);
                }
                Section::SuccessCriteria => {
                    if let Some(rest) = next.trim_start().strip_prefix("- [x] ") {
                        success_criteria.push(SuccessCriterion { text: rest.to_string(), done: true });
                    } else if let Some(rest) = next.trim_start().strip_prefix("- [ ] ") {
                        success_criteria.push(SuccessCriterion { text: rest.to_string(), done: false });
                    }
                }
                Section::DimensionalProfile => {
                    if let Some((key, value)) = next.trim_start().strip_prefix("- ").and_then(|l| l.split_once(':')) {
                        let value: f64 = value.trim().parse().unwrap_or(0.0);
                        match key.trim() {
                            "temporal" => profile.temporal = value,
                            "functional" => profile.functional = value,
                            "data" => profile.data = value,
                            "state" => profile.state = value,
                            "error" => profile.error = value,
                            "context" => profile.context = value,
                            "integration" => profile.integration = value,
                            _ => {}
                        }
                    }
                }
                Section::Tasks => {
                    if let Some(rest) = next.trim_start().strip_prefix("- ") {
                        let id = rest.trim();
                        if !id.is_empty() {
                            tasks.push(id.to_string());
                        }
                    }
                }
                Section::None => {}
            }
        }

        objectives.push(ObjectiveRecord {
            id,
            title,
            description: description.trim().to_string(),
            status,
            priority,
            success_criteria,
            dependencies,
            dimensional_profile: profile,
            tasks,
        });
    }

    Ok(objectives)
}

fn split_heading(heading: &str) -> (String, String) {
    match heading.split_once('—').or_else(|| heading.split_once('-')) {
        Some((id, title)) => (id.trim().to_string(), title.trim().to_string()),
        None => (heading.trim().to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectiveRecord {
        ObjectiveRecord {
            id: "primary_001".to_string(),
            title: "Build CLI tool".to_string(),
            description: "Ship a working command-line entry point.".to_string(),
            status: "active".to_string(),
            priority: Priority::High,
            success_criteria: vec![
                SuccessCriterion { text: "compiles cleanly".to_string(), done: true },
                SuccessCriterion { text: "handles --help".to_string(), done: false },
            ],
            dependencies: vec!["primary_000".to_string()],
            dimensional_profile: DimensionalProfile {
                temporal: 0.2,
                functional: 0.9,
                data: 0.1,
                state: 0.3,
                error: 0.4,
                context: 0.5,
                integration: 0.6,
            },
            tasks: vec!["T1".to_string(), "T2".to_string()],
        }
    }

    #[test]
    fn render_then_parse_round_trips_r1() {
        let objectives = vec![sample()];
        let rendered = render_objectives(&objectives);
        let parsed = parse_objectives(&rendered).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "primary_001");
        assert_eq!(parsed[0].title, "Build CLI tool");
        assert_eq!(parsed[0].tasks, vec!["T1", "T2"]);
        assert_eq!(parsed[0].success_criteria.len(), 2);
        assert!(parsed[0].success_criteria[0].done);
        assert!(!parsed[0].success_criteria[1].done);
        assert_eq!(parsed[0].dependencies, vec!["primary_000"]);
        assert_eq!(parsed[0].dimensional_profile.functional, 0.9);
    }

    #[test]
    fn double_round_trip_is_idempotent() {
        let objectives = vec![sample()];
        let first = render_objectives(&parse_objectives(&render_objectives(&objectives)).unwrap());
        let second = render_objectives(&parse_objectives(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn task_list_preserves_insertion_order() {
        let mut objective = sample();
        objective.tasks = vec!["T3".to_string(), "T1".to_string(), "T2".to_string()];
        let rendered = render_objectives(&[objective]);
        let parsed = parse_objectives(&rendered).unwrap();
        assert_eq!(parsed[0].tasks, vec!["T3", "T1", "T2"]);
    }

    #[test]
    fn parses_multiple_objectives_in_one_file() {
        let mut second = sample();
        second.id = "primary_002".to_string();
        second.title = "Add tests".to_string();
        let rendered = render_objectives(&[sample(), second]);
        let parsed = parse_objectives(&rendered).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].id, "primary_002");
    }
}
