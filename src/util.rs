//! Shared utility functions.

use std::path::{Component, Path, PathBuf};

/// Normalize a tool-supplied path argument and confirm it stays under `root`.
///
/// Trims whitespace, converts Windows separators, strips repeated leading
/// `./`, and resolves `..` components lexically (no filesystem access, so
/// this also works for paths that don't exist yet). Returns the
/// root-relative path on success, or the escaped absolute path on failure
/// so the caller can report it.
pub fn normalize_contained_path(root: &Path, raw: &str) -> Result<PathBuf, PathBuf> {
    let trimmed = raw.trim().replace('\\', "/");
    let mut stripped = trimmed.as_str();
    while let Some(rest) = stripped.strip_prefix("./") {
        stripped = rest;
    }

    let mut resolved = PathBuf::new();
    for component in Path::new(stripped).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                if !resolved.pop() {
                    // Escaped above the root before joining; report the
                    // would-be absolute path for the error message.
                    return Err(root.join(stripped));
                }
            }
            Component::CurDir | Component::Prefix(_) => {}
            Component::RootDir => {
                // An absolute path argument; treat it as root-relative by
                // dropping the leading separator rather than trusting it.
            }
        }
    }

    Ok(resolved)
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}
