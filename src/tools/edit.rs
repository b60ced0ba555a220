use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{ToolError, ToolResult, truncate_utf8};

const SNIPPET_LINES: usize = 4;
const MAX_VIEW_BYTES: usize = 16_000;

#[derive(Debug, Deserialize)]
struct EditInput {
    command: String,
    path: String,
    #[serde(default)]
    file_text: Option<String>,
    #[serde(default)]
    view_range: Option<Vec<i64>>,
    #[serde(default)]
    old_str: Option<String>,
    #[serde(default)]
    new_str: Option<String>,
    #[serde(default)]
    insert_line: Option<usize>,
}

/// File viewer and editor. Keeps per-file history so edits can be undone.
pub(super) struct EditTool {
    history: Mutex<HashMap<PathBuf, Vec<String>>>,
}

impl EditTool {
    pub(super) fn new() -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
        }
    }

    pub(super) async fn run(&self, input: serde_json::Value) -> Result<ToolResult, ToolError> {
        let input: EditInput = serde_json::from_value(input)
            .map_err(|e| ToolError::InvalidInput(format!("invalid editor input: {e}")))?;
        let path = PathBuf::from(&input.path);
        if !path.is_absolute() {
            return Err(ToolError::InvalidInput(format!(
                "The path {} is not an absolute path, it should start with `/`.",
                input.path
            )));
        }

        match input.command.as_str() {
            "view" => self.view(&path, input.view_range.as_deref()).await,
            "create" => {
                let text = input.file_text.ok_or_else(|| {
                    ToolError::InvalidInput("Parameter `file_text` is required for command: create".into())
                })?;
                self.create(&path, &text).await
            }
            "str_replace" => {
                let old = input.old_str.ok_or_else(|| {
                    ToolError::InvalidInput("Parameter `old_str` is required for command: str_replace".into())
                })?;
                self.str_replace(&path, &old, input.new_str.as_deref().unwrap_or_default())
                    .await
            }
            "insert" => {
                let line = input.insert_line.ok_or_else(|| {
                    ToolError::InvalidInput("Parameter `insert_line` is required for command: insert".into())
                })?;
                let text = input.new_str.ok_or_else(|| {
                    ToolError::InvalidInput("Parameter `new_str` is required for command: insert".into())
                })?;
                self.insert(&path, line, &text).await
            }
            "undo_edit" => self.undo(&path).await,
            other => Err(ToolError::InvalidInput(format!(
                "Unrecognized command {other}. The allowed commands are: view, create, str_replace, insert, undo_edit"
            ))),
        }
    }

    async fn view(&self, path: &Path, range: Option<&[i64]>) -> Result<ToolResult, ToolError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| not_found(path, e))?;
        if metadata.is_dir() {
            if range.is_some() {
                return Err(ToolError::InvalidInput(
                    "The `view_range` parameter is not allowed when `path` points to a directory."
                        .into(),
                ));
            }
            let entries = list_dir(path, 2).await?;
            return Ok(ToolResult::output(format!(
                "Here's the files and directories up to 2 levels deep in {}, excluding hidden items:\n{}",
                path.display(),
                entries.join("\n")
            )));
        }

        let content = tokio::fs::read_to_string(path).await?;
        let lines: Vec<&str> = content.split('\n').collect();
        let (start, shown) = match range {
            None => (1, content.clone()),
            Some([start, end]) => {
                let n = lines.len() as i64;
                if *start < 1 || *start > n {
                    return Err(ToolError::InvalidInput(format!(
                        "Invalid `view_range`: {range:?}. Its first element `{start}` should be within the range of lines of the file: [1, {n}]"
                    )));
                }
                let end = if *end == -1 { n } else { *end };
                if end < *start || end > n {
                    return Err(ToolError::InvalidInput(format!(
                        "Invalid `view_range`: {range:?}. Its second element `{end}` should be -1 or within [{start}, {n}]"
                    )));
                }
                let slice = &lines[(*start as usize - 1)..(end as usize)];
                (*start as usize, slice.join("\n"))
            }
            Some(other) => {
                return Err(ToolError::InvalidInput(format!(
                    "Invalid `view_range`: {other:?}. It should be a list of two integers."
                )));
            }
        };

        let mut numbered = numbered(&shown, start);
        if numbered.len() > MAX_VIEW_BYTES {
            numbered = format!("{}\n<response clipped>", truncate_utf8(&numbered, MAX_VIEW_BYTES));
        }
        Ok(ToolResult::output(format!(
            "Here's the result of running `cat -n` on {}:\n{numbered}\n",
            path.display()
        )))
    }

    async fn create(&self, path: &Path, text: &str) -> Result<ToolResult, ToolError> {
        if tokio::fs::try_exists(path).await? {
            return Err(ToolError::InvalidInput(format!(
                "File already exists at: {}. Cannot overwrite files using command `create`.",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, text).await?;
        self.remember(path, String::new()).await;
        Ok(ToolResult::output(format!(
            "File created successfully at: {}",
            path.display()
        )))
    }

    async fn str_replace(&self, path: &Path, old: &str, new: &str) -> Result<ToolResult, ToolError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| not_found(path, e))?;

        let positions: Vec<usize> = content.match_indices(old).map(|(i, _)| i).collect();
        match positions.as_slice() {
            [] => Err(ToolError::InvalidInput(format!(
                "No replacement was performed, old_str `{old}` did not appear verbatim in {}.",
                path.display()
            ))),
            [at] => {
                let updated = format!("{}{new}{}", &content[..*at], &content[at + old.len()..]);
                tokio::fs::write(path, &updated).await?;
                self.remember(path, content.clone()).await;

                let line = content[..*at].matches('\n').count();
                let snippet = snippet_around(&updated, line, new.matches('\n').count());
                Ok(ToolResult::output(format!(
                    "The file {} has been edited. Here's the result of running `cat -n` on a snippet:\n{snippet}\nReview the changes and make sure they are as expected. Edit the file again if necessary.",
                    path.display()
                )))
            }
            many => {
                let lines: Vec<String> = many
                    .iter()
                    .map(|i| (content[..*i].matches('\n').count() + 1).to_string())
                    .collect();
                Err(ToolError::InvalidInput(format!(
                    "No replacement was performed. Multiple occurrences of old_str `{old}` in lines [{}]. Please ensure it is unique",
                    lines.join(", ")
                )))
            }
        }
    }

    async fn insert(&self, path: &Path, insert_line: usize, text: &str) -> Result<ToolResult, ToolError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| not_found(path, e))?;
        let mut lines: Vec<&str> = content.split('\n').collect();
        if insert_line > lines.len() {
            return Err(ToolError::InvalidInput(format!(
                "Invalid `insert_line` parameter: {insert_line}. It should be within the range of lines of the file: [0, {}]",
                lines.len()
            )));
        }

        let new_lines: Vec<&str> = text.split('\n').collect();
        let inserted = new_lines.len();
        lines.splice(insert_line..insert_line, new_lines);
        let updated = lines.join("\n");
        tokio::fs::write(path, &updated).await?;
        self.remember(path, content.clone()).await;

        let snippet = snippet_around(&updated, insert_line, inserted.saturating_sub(1));
        Ok(ToolResult::output(format!(
            "The file {} has been edited. Here's the result of running `cat -n` on a snippet of the edited file:\n{snippet}\nReview the changes and make sure they are as expected (correct indentation, no duplicate lines, etc). Edit the file again if necessary.",
            path.display()
        )))
    }

    async fn undo(&self, path: &Path) -> Result<ToolResult, ToolError> {
        let previous = self
            .history
            .lock()
            .await
            .get_mut(path)
            .and_then(|versions| versions.pop())
            .ok_or_else(|| {
                ToolError::InvalidInput(format!("No edit history found for {}.", path.display()))
            })?;
        tokio::fs::write(path, &previous).await?;
        Ok(ToolResult::output(format!(
            "Last edit to {} undone successfully. Here's the result of running `cat -n` on {}:\n{}\n",
            path.display(),
            path.display(),
            numbered(&previous, 1)
        )))
    }

    async fn remember(&self, path: &Path, content: String) {
        self.history
            .lock()
            .await
            .entry(path.to_path_buf())
            .or_default()
            .push(content);
    }
}

fn not_found(path: &Path, err: io::Error) -> ToolError {
    if err.kind() == io::ErrorKind::NotFound {
        ToolError::InvalidInput(format!(
            "The path {} does not exist. Please provide a valid path.",
            path.display()
        ))
    } else {
        err.into()
    }
}

fn numbered(content: &str, first_line: usize) -> String {
    content
        .split('\n')
        .enumerate()
        .map(|(i, line)| format!("{:6}\t{line}", i + first_line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Numbered lines around an edit that starts at zero-based `line` and spans
/// `extra` additional lines.
fn snippet_around(content: &str, line: usize, extra: usize) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let start = line.saturating_sub(SNIPPET_LINES);
    let end = (line + extra + SNIPPET_LINES + 1).min(lines.len());
    numbered(&lines[start..end].join("\n"), start + 1)
}

async fn list_dir(root: &Path, depth: usize) -> Result<Vec<String>, ToolError> {
    let mut found = Vec::new();
    let mut pending = vec![(root.to_path_buf(), 0)];

    while let Some((dir, level)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                found.push(format!("{}/", path.display()));
                if level + 1 < depth {
                    pending.push((path, level + 1));
                }
            } else {
                found.push(path.display().to_string());
            }
        }
    }

    found.sort();
    Ok(found)
}
