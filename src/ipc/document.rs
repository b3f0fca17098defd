//! Section-scoped markdown documents (§6 "IPC document contract").
//!
//! A document is front matter (everything before the first `##` heading)
//! followed by an ordered list of sections, each introduced by a `## `
//! heading. Writing a section replaces only its content; every other
//! section and the front matter survive untouched (R2).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::FatalStateError;

const APPEND_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub heading: String,
    pub content: String,
}

/// An in-memory, parsed IPC document. `front_matter` is everything before
/// the first `## ` heading, preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpcDocument {
    pub front_matter: String,
    sections: Vec<Section>,
    order: BTreeMap<String, usize>,
}

impl IpcDocument {
    pub fn new(front_matter: impl Into<String>) -> Self {
        Self {
            front_matter: front_matter.into(),
            sections: Vec::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let mut front_matter = String::new();
        let mut sections = Vec::new();
        let mut order = BTreeMap::new();

        let mut current_heading: Option<String> = None;
        let mut current_body = String::new();
        let mut seen_heading = false;

        for line in raw.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                if let Some(prev_heading) = current_heading.take() {
                    push_section(&mut sections, &mut order, prev_heading, current_body.trim_end().to_string());
                } else if !seen_heading {
                    front_matter = current_body.trim_end().to_string();
                }
                current_body.clear();
                current_heading = Some(heading.trim().to_string());
                seen_heading = true;
                continue;
            }
            current_body.push_str(line);
            current_body.push('\n');
        }

        match current_heading {
            Some(heading) => push_section(&mut sections, &mut order, heading, current_body.trim_end().to_string()),
            None if !seen_heading => front_matter = current_body.trim_end().to_string(),
            None => {}
        }

        Self { front_matter, sections, order }
    }

    pub fn section(&self, heading: &str) -> Option<&str> {
        self.order.get(heading).map(|&i| self.sections[i].content.as_str())
    }

    pub fn headings(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.heading.as_str())
    }

    /// Replace a section's content in place, or append a new section at
    /// the end if the heading didn't exist yet.
    pub fn set_section(&mut self, heading: &str, content: impl Into<String>) {
        let content = content.into();
        if let Some(&index) = self.order.get(heading) {
            self.sections[index].content = content;
        } else {
            self.order.insert(heading.to_string(), self.sections.len());
            self.sections.push(Section { heading: heading.to_string(), content });
        }
    }

    /// Append to a section, separated from its prior content by a
    /// horizontal rule. Appending identical content twice in a row is a
    /// no-op (R2): a section's trailing content already equal to `addition`
    /// is not duplicated.
    pub fn append_section(&mut self, heading: &str, addition: &str) {
        match self.order.get(heading).copied() {
            Some(index) => {
                let existing = &self.sections[index].content;
                if existing.trim_end().ends_with(addition.trim()) {
                    return;
                }
                if existing.trim().is_empty() {
                    self.sections[index].content = addition.to_string();
                } else {
                    let merged = format!("{}{}{}", existing.trim_end(), APPEND_SEPARATOR, addition.trim());
                    self.sections[index].content = merged;
                }
            }
            None => self.set_section(heading, addition.to_string()),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.front_matter.trim().is_empty() {
            out.push_str(self.front_matter.trim_end());
            out.push('\n');
        }
        for section in &self.sections {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("## ");
            out.push_str(&section.heading);
            out.push('\n');
            let content = section.content.trim_end();
            if !content.is_empty() {
                out.push_str(content);
                out.push('\n');
            }
        }
        out
    }
}

fn push_section(sections: &mut Vec<Section>, order: &mut BTreeMap<String, usize>, heading: String, content: String) {
    match order.get(&heading) {
        Some(&index) => sections[index].content = content,
        None => {
            order.insert(heading.clone(), sections.len());
            sections.push(Section { heading, content });
        }
    }
}

/// Load a document from disk, or an empty one with the given default
/// front matter if the file doesn't exist yet (strategic documents are
/// "initialized from templates if absent").
pub fn load_or_init(path: &Path, default_front_matter: &str) -> Result<IpcDocument, FatalStateError> {
    if !path.exists() {
        return Ok(IpcDocument::new(default_front_matter));
    }
    let raw = fs::read_to_string(path).map_err(|source| FatalStateError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(IpcDocument::parse(&raw))
}

pub fn save(path: &Path, document: &IpcDocument) -> Result<(), FatalStateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| FatalStateError::WriteFailed {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, document.render()).map_err(|source| FatalStateError::WriteFailed {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| FatalStateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_separates_front_matter_and_sections() {
        let raw = "# MASTER PLAN\n\n## Architecture\nSome text.\n\n## Objectives\nMore text.\n";
        let doc = IpcDocument::parse(raw);
        assert!(doc.front_matter.contains("MASTER PLAN"));
        assert_eq!(doc.section("Architecture"), Some("Some text."));
        assert_eq!(doc.section("Objectives"), Some("More text."));
    }

    #[test]
    fn set_section_replaces_without_touching_others() {
        let raw = "## A\nfirst\n\n## B\nsecond\n";
        let mut doc = IpcDocument::parse(raw);
        doc.set_section("A", "updated");
        assert_eq!(doc.section("A"), Some("updated"));
        assert_eq!(doc.section("B"), Some("second"));
    }

    #[test]
    fn set_section_appends_new_heading_at_end() {
        let mut doc = IpcDocument::parse("## A\nfirst\n");
        doc.set_section("C", "third");
        let headings: Vec<&str> = doc.headings().collect();
        assert_eq!(headings, vec!["A", "C"]);
    }

    #[test]
    fn append_section_separates_with_horizontal_rule() {
        let mut doc = IpcDocument::parse("## Notes\nfirst note\n");
        doc.append_section("Notes", "second note");
        let rendered = doc.section("Notes").unwrap();
        assert!(rendered.contains("first note"));
        assert!(rendered.contains("---"));
        assert!(rendered.contains("second note"));
    }

    #[test]
    fn append_section_twice_with_same_content_is_idempotent_r2() {
        let mut doc = IpcDocument::parse("## Notes\nfirst note\n");
        doc.append_section("Notes", "second note");
        let after_one = doc.render();
        doc.append_section("Notes", "second note");
        let after_two = doc.render();
        assert_eq!(after_one, after_two);
    }

    #[test]
    fn render_round_trips_parse() {
        let raw = "Front matter line.\n\n## A\nbody a\n\n## B\nbody b\n";
        let doc = IpcDocument::parse(raw);
        let rendered = doc.render();
        let reparsed = IpcDocument::parse(&rendered);
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn load_or_init_returns_default_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MASTER_PLAN.md");
        let doc = load_or_init(&path, "# Master Plan\n").unwrap();
        assert_eq!(doc.front_matter.trim(), "# Master Plan");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PLANNING_WRITE.md");
        let mut doc = IpcDocument::new("# Planning output");
        doc.set_section("Summary", "Created 3 tasks.");
        save(&path, &doc).unwrap();

        let reloaded = load_or_init(&path, "unused").unwrap();
        assert_eq!(reloaded.section("Summary"), Some("Created 3 tasks."));
    }
}
