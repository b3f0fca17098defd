//! Built-in tool handlers (SPEC_FULL.md §4.3 catalog table).
//!
//! Every handler receives already-validated, already-path-normalized
//! arguments; none of them touch a path the dispatcher hasn't cleared.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};

use crate::signal;

use super::registry::{HandlerContext, SafetyClass, ToolCategory, ToolRegistry, ToolSchema};

fn str_arg<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing required string argument '{key}'"))
}

fn read_file(ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let path = str_arg(args, "path")?;
    let full_path = ctx.project_dir.join(path);
    let content = fs::read_to_string(&full_path).with_context(|| format!("reading {}", full_path.display()))?;

    let (start, end) = (
        args.get("start_line").and_then(Value::as_u64),
        args.get("end_line").and_then(Value::as_u64),
    );
    let content = match (start, end) {
        (Some(start), Some(end)) => content
            .lines()
            .skip(start.saturating_sub(1) as usize)
            .take((end.saturating_sub(start) + 1) as usize)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => content,
    };
    Ok(json!({ "path": path, "content": content }))
}

fn write_file(ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let path = str_arg(args, "path")?;
    let content = str_arg(args, "content")?;
    let full_path = ctx.project_dir.join(path);
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full_path, content).with_context(|| format!("writing {}", full_path.display()))?;
    Ok(json!({ "path": path, "bytes_written": content.len() }))
}

fn str_replace(ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let path = str_arg(args, "path")?;
    let old = str_arg(args, "old_str")?;
    let new = str_arg(args, "new_str")?;
    let full_path = ctx.project_dir.join(path);
    let content = fs::read_to_string(&full_path).with_context(|| format!("reading {}", full_path.display()))?;

    let occurrences = content.matches(old).count();
    if occurrences != 1 {
        return Err(anyhow!(
            "expected exactly one occurrence of old_str in {path}, found {occurrences}"
        ));
    }
    let updated = content.replacen(old, new, 1);
    fs::write(&full_path, updated).with_context(|| format!("writing {}", full_path.display()))?;
    Ok(json!({ "path": path, "replaced": true }))
}

fn list_files(ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let glob_pattern = args.get("glob").and_then(Value::as_str).unwrap_or("*");
    let root = ctx.project_dir.join(rel);

    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if glob_match(glob_pattern, &name) {
            if let Ok(relative) = entry.path().strip_prefix(ctx.project_dir) {
                matches.push(relative.to_string_lossy().to_string());
            }
        }
    }
    matches.sort();
    Ok(json!({ "files": matches }))
}

/// Scans source files for import-like statements (`use foo::bar`, `import
/// foo`, `from foo import bar`), builds a module dependency graph keyed by
/// file stem, and DFS-walks it for a cycle. Analysis-only: it never
/// modifies anything, it just feeds `loop_detector.raise(CircularDependency, ..)`
/// when it finds one.
fn check_dependency_cycle(ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
    let root = ctx.project_dir.join(rel);

    let import_re = regex::Regex::new(r#"^\s*(?:use|import|from)\s+([A-Za-z_][\w:.]*)"#).expect("static regex is valid");
    let mut graph: std::collections::BTreeMap<String, std::collections::BTreeSet<String>> = std::collections::BTreeMap::new();

    for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(stem) = entry.path().file_stem().map(|s| s.to_string_lossy().to_string()) else { continue };
        let Ok(content) = fs::read_to_string(entry.path()) else { continue };
        let deps = graph.entry(stem).or_default();
        for line in content.lines() {
            if let Some(caps) = import_re.captures(line) {
                let module = caps[1].split(['.', ':']).next().unwrap_or(&caps[1]).to_string();
                deps.insert(module);
            }
        }
    }

    let cycle = find_cycle(&graph);
    Ok(json!({ "cycle_found": cycle.is_some(), "cycle": cycle }))
}

/// DFS with a recursion stack; returns the first cycle found as a path of
/// node names, or `None` if the graph is acyclic.
fn find_cycle(graph: &std::collections::BTreeMap<String, std::collections::BTreeSet<String>>) -> Option<Vec<String>> {
    let mut visited = std::collections::BTreeSet::new();
    let mut stack = Vec::new();
    let mut on_stack = std::collections::BTreeSet::new();

    for node in graph.keys() {
        if !visited.contains(node) {
            if let Some(cycle) = visit_node(node, graph, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit_node(
    node: &str,
    graph: &std::collections::BTreeMap<String, std::collections::BTreeSet<String>>,
    visited: &mut std::collections::BTreeSet<String>,
    stack: &mut Vec<String>,
    on_stack: &mut std::collections::BTreeSet<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    stack.push(node.to_string());
    on_stack.insert(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if on_stack.contains(dep) {
                let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep) && graph.contains_key(dep) {
                if let Some(cycle) = visit_node(dep, graph, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    on_stack.remove(node);
    None
}

/// Minimal `*`/`?` glob matcher; sufficient for the single-segment
/// filename patterns this tool accepts.
fn glob_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let regex_src = format!(
        "^{}$",
        regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".")
    );
    regex::Regex::new(&regex_src).map(|re| re.is_match(name)).unwrap_or(false)
}

/// Runs on the calling worker thread via `block_in_place` so the rest of
/// the tokio runtime keeps making progress while this handler supervises
/// its child (§4.3 step 5: long-running handlers get their own worker).
fn run_tests(ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let command = args.get("command").and_then(Value::as_str).unwrap_or("cargo test").to_string();
    let project_dir = ctx.project_dir.to_path_buf();
    let deadline = Duration::from_millis(ctx.deadline_ms);

    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(run_tests_async(&command, &project_dir, deadline))
    })
}

/// Spawns the test command in its own process group so the whole run,
/// including anything it spawns, can be killed as a unit (§5, Scenario
/// S6) if the deadline passes or the coordinator is cancelled.
async fn run_tests_async(command: &str, project_dir: &Path, deadline: Duration) -> anyhow::Result<Value> {
    let mut parts = command.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow!("empty test command"))?;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(parts)
        .current_dir(project_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec(), where only
    // async-signal-safe calls are permitted; setpgid is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0)).map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().with_context(|| format!("spawning test command '{command}'"))?;
    let pgid = child
        .id()
        .ok_or_else(|| anyhow!("test command '{command}' exited before its pid could be read"))? as i32;
    signal::register_process_group(pgid);

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(result) => {
            signal::unregister_process_group(pgid);
            let output = result.with_context(|| format!("waiting for test command '{command}'"))?;
            Ok(json!({
                "exit_code": output.status.code().unwrap_or(-1),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }))
        }
        Err(_) => {
            signal::kill_process_group(pgid).await;
            signal::unregister_process_group(pgid);
            Err(anyhow!("test command '{command}' exceeded its {}ms deadline", deadline.as_millis()))
        }
    }
}

fn report_issue(_ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let filepath = str_arg(args, "filepath").or_else(|_| str_arg(args, "file"))?;
    let description = str_arg(args, "description")?;
    Ok(json!({
        "filepath": filepath,
        "issue_type": args.get("issue_type").and_then(Value::as_str).unwrap_or("defect"),
        "description": description,
        "line_number": args.get("line_number").and_then(Value::as_u64),
    }))
}

fn approve_code(_ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let filepath = str_arg(args, "filepath")?;
    Ok(json!({ "filepath": filepath, "approved": true }))
}

fn create_task(_ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let description = str_arg(args, "description")?;
    let files: Vec<String> = args
        .get("files")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let objective_id = args.get("objective_id").and_then(Value::as_str);
    Ok(json!({ "description": description, "files": files, "objective_id": objective_id }))
}

fn ask_user(_ctx: &HandlerContext, args: &Value) -> anyhow::Result<Value> {
    let reason = str_arg(args, "reason")?;
    Ok(json!({ "reason": reason, "escalated": true }))
}

fn delete_file(_ctx: &HandlerContext, _args: &Value) -> anyhow::Result<Value> {
    Err(anyhow!("delete_file is denied by default configuration"))
}

pub fn register_builtins(registry: &mut ToolRegistry) {
    registry.register(ToolSchema {
        name: "read_file".to_string(),
        description: "Read a project file, optionally a line range.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec!["path".to_string()],
        handler: Arc::new(read_file),
    });
    registry.register(ToolSchema {
        name: "write_file".to_string(),
        description: "Create or overwrite a project file.".to_string(),
        category: ToolCategory::ToolsCoding,
        safety_class: SafetyClass::Guarded,
        path_arguments: vec!["path".to_string()],
        handler: Arc::new(write_file),
    });
    registry.register(ToolSchema {
        name: "str_replace".to_string(),
        description: "Replace one exact text occurrence in a file.".to_string(),
        category: ToolCategory::ToolsCoding,
        safety_class: SafetyClass::Guarded,
        path_arguments: vec!["path".to_string()],
        handler: Arc::new(str_replace),
    });
    registry.register(ToolSchema {
        name: "list_files".to_string(),
        description: "List files under a path matching a glob.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec!["path".to_string()],
        handler: Arc::new(list_files),
    });
    registry.register(ToolSchema {
        name: "run_tests".to_string(),
        description: "Run the project's test command with a deadline.".to_string(),
        category: ToolCategory::ToolsCoding,
        safety_class: SafetyClass::Guarded,
        path_arguments: vec![],
        handler: Arc::new(run_tests),
    });
    registry.register(ToolSchema {
        name: "report_issue".to_string(),
        description: "QA: report a defect against a file/line.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec![],
        handler: Arc::new(report_issue),
    });
    registry.register(ToolSchema {
        name: "approve_code".to_string(),
        description: "QA: approve a file with zero issues.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec![],
        handler: Arc::new(approve_code),
    });
    registry.register(ToolSchema {
        name: "create_task".to_string(),
        description: "Planning: propose a new task, optionally linked to an objective_id.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec![],
        handler: Arc::new(create_task),
    });
    registry.register(ToolSchema {
        name: "check_dependency_cycle".to_string(),
        description: "Analysis: scan project imports for a circular dependency.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec!["path".to_string()],
        handler: Arc::new(check_dependency_cycle),
    });
    registry.register(ToolSchema {
        name: "ask_user".to_string(),
        description: "Escalate to a human.".to_string(),
        category: ToolCategory::ToolsAnalysis,
        safety_class: SafetyClass::Safe,
        path_arguments: vec![],
        handler: Arc::new(ask_user),
    });
    registry.register(ToolSchema {
        name: "delete_file".to_string(),
        description: "Delete a project file. Denied by default.".to_string(),
        category: ToolCategory::ToolsCoding,
        safety_class: SafetyClass::Denied,
        path_arguments: vec!["path".to_string()],
        handler: Arc::new(delete_file),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(dir: &std::path::Path) -> HandlerContext {
        HandlerContext { project_dir: dir, phase: "coding", deadline_ms: 120_000 }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "a.txt", "content": "hello"})).unwrap();
        let result = read_file(&ctx(dir.path()), &json!({"path": "a.txt"})).unwrap();
        assert_eq!(result["content"], "hello");
    }

    #[test]
    fn str_replace_requires_unique_match() {
        let dir = tempdir().unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "a.txt", "content": "foo foo"})).unwrap();
        let result = str_replace(&ctx(dir.path()), &json!({"path": "a.txt", "old_str": "foo", "new_str": "bar"}));
        assert!(result.is_err());
    }

    #[test]
    fn str_replace_succeeds_with_unique_match() {
        let dir = tempdir().unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "a.txt", "content": "foo bar"})).unwrap();
        str_replace(&ctx(dir.path()), &json!({"path": "a.txt", "old_str": "foo", "new_str": "baz"})).unwrap();
        let result = read_file(&ctx(dir.path()), &json!({"path": "a.txt"})).unwrap();
        assert_eq!(result["content"], "baz bar");
    }

    #[test]
    fn list_files_filters_by_glob() {
        let dir = tempdir().unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "a.rs", "content": ""})).unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "b.md", "content": ""})).unwrap();
        let result = list_files(&ctx(dir.path()), &json!({"glob": "*.rs"})).unwrap();
        let files: Vec<String> = result["files"].as_array().unwrap().iter().map(|v| v.as_str().unwrap().to_string()).collect();
        assert_eq!(files, vec!["a.rs"]);
    }

    #[test]
    fn report_issue_accepts_filepath_or_file_key() {
        let result = report_issue(&ctx(std::path::Path::new(".")), &json!({
            "file": "a.py", "description": "off by one", "issue_type": "bug", "line_number": 10
        })).unwrap();
        assert_eq!(result["filepath"], "a.py");
    }

    #[test]
    fn delete_file_handler_always_errors() {
        let result = delete_file(&ctx(std::path::Path::new(".")), &json!({"path": "a.txt"}));
        assert!(result.is_err());
    }

    #[test]
    fn check_dependency_cycle_finds_mutual_imports() {
        let dir = tempdir().unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "a.py", "content": "import b\n"})).unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "b.py", "content": "import a\n"})).unwrap();
        let result = check_dependency_cycle(&ctx(dir.path()), &json!({})).unwrap();
        assert_eq!(result["cycle_found"], true);
    }

    #[test]
    fn check_dependency_cycle_clean_on_acyclic_imports() {
        let dir = tempdir().unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "a.py", "content": "import b\n"})).unwrap();
        write_file(&ctx(dir.path()), &json!({"path": "b.py", "content": "x = 1\n"})).unwrap();
        let result = check_dependency_cycle(&ctx(dir.path()), &json!({})).unwrap();
        assert_eq!(result["cycle_found"], false);
    }
}
