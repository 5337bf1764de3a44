//! Dataset loading: turning a dataset reference into an ordered list of [`WorkItem`]s.
//!
//! Two sources ship with the crate:
//!
//! * [`InMemoryDatasets`]: named datasets held in memory (e.g. uploaded through an API).
//! * [`FileDatasetSource`]: `.csv`, `.tsv`, `.json` (array of objects) and `.jsonl` files.
//!
//! Rows are mapped onto work items the same way for every format: the text comes from the
//! first non-empty of `text`, `content`, `article`, `title`, `description` or `message`
//! (with the title prepended when a separate body exists), the id from `id` / `article_id`
//! or the row position, and the ground-truth label from `label` / `target`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const TEXT_COLUMNS: [&str; 6] = ["text", "content", "article", "title", "description", "message"];
const BODY_COLUMNS: [&str; 3] = ["text", "content", "article"];
const ID_COLUMNS: [&str; 2] = ["id", "article_id"];
const LABEL_COLUMNS: [&str; 2] = ["label", "target"];

/// One unit of input the protocol runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// The text under analysis.
    pub text: String,
    /// Ground-truth label, if the dataset carries one.
    pub label: Option<String>,
    /// Every raw column of the source row.
    pub fields: BTreeMap<String, String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            label: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Build an item from a column map; `None` when the row has no usable text.
    pub fn from_row(index: usize, row: BTreeMap<String, String>) -> Option<Self> {
        let lookup = |names: &[&str]| {
            names.iter().find_map(|name| {
                row.get(*name)
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
        };

        let title = lookup(&["title"][..]);
        let body = lookup(&BODY_COLUMNS[..]);
        let text = match (title, body) {
            (Some(title), Some(body)) => format!("Title: {}\n\nContent: {}", title, body),
            _ => lookup(&TEXT_COLUMNS[..])?,
        };
        let id = lookup(&ID_COLUMNS[..]).unwrap_or_else(|| index.to_string());
        let label = lookup(&LABEL_COLUMNS[..]);

        Some(Self {
            id,
            text,
            label,
            fields: row,
        })
    }
}

/// Why a dataset could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetError {
    NotFound(String),
    Unreadable { reference: String, reason: String },
    Malformed { reference: String, reason: String },
    /// The dataset loaded but yielded no usable items.
    Empty(String),
}

impl fmt::Display for DatasetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetError::NotFound(r) => write!(f, "Dataset not found: {}", r),
            DatasetError::Unreadable { reference, reason } => {
                write!(f, "Dataset {} could not be read: {}", reference, reason)
            }
            DatasetError::Malformed { reference, reason } => {
                write!(f, "Dataset {} is malformed: {}", reference, reason)
            }
            DatasetError::Empty(r) => write!(f, "Dataset {} contains no usable items", r),
        }
    }
}

impl Error for DatasetError {}

/// Resolves a dataset reference into items.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Load at most `limit` items (all when `None`), in dataset order.
    async fn load(
        &self,
        reference: &str,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, DatasetError>;
}

/// Named datasets kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryDatasets {
    datasets: RwLock<HashMap<String, Vec<WorkItem>>>,
}

impl InMemoryDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, name: &str, items: Vec<WorkItem>) -> Self {
        self.insert(name, items);
        self
    }

    /// Store (or replace) a dataset.
    pub fn insert(&self, name: &str, items: Vec<WorkItem>) {
        self.datasets
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), items);
    }

    pub fn remove(&self, name: &str) -> Option<Vec<WorkItem>> {
        self.datasets
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
    }

    /// Parse CSV/TSV text and store the resulting items under `name`. Returns the item count.
    pub fn insert_csv(&self, name: &str, content: &str) -> Result<usize, DatasetError> {
        let items = rows_to_items(name, parse_delimited(name, content)?)?;
        let count = items.len();
        self.insert(name, items);
        Ok(count)
    }
}

#[async_trait]
impl DatasetSource for InMemoryDatasets {
    async fn load(
        &self,
        reference: &str,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, DatasetError> {
        let datasets = self.datasets.read().unwrap_or_else(|p| p.into_inner());
        let items = datasets
            .get(reference)
            .ok_or_else(|| DatasetError::NotFound(reference.to_string()))?;
        if items.is_empty() {
            return Err(DatasetError::Empty(reference.to_string()));
        }
        Ok(apply_limit(items.clone(), limit))
    }
}

/// Loads datasets from files, optionally relative to a root directory.
#[derive(Debug, Clone, Default)]
pub struct FileDatasetSource {
    root: Option<PathBuf>,
}

impl FileDatasetSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative references against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl DatasetSource for FileDatasetSource {
    async fn load(
        &self,
        reference: &str,
        limit: Option<usize>,
    ) -> Result<Vec<WorkItem>, DatasetError> {
        let path = self.resolve(reference);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatasetError::NotFound(reference.to_string()))
            }
            Err(e) => {
                return Err(DatasetError::Unreadable {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let rows = match extension.as_str() {
            "json" => parse_json_array(reference, &content)?,
            "jsonl" | "ndjson" => parse_json_lines(reference, &content)?,
            _ => parse_delimited(reference, &content)?,
        };
        let items = rows_to_items(reference, rows)?;
        log::debug!("loaded {} items from {}", items.len(), path.display());
        Ok(apply_limit(items, limit))
    }
}

fn apply_limit(mut items: Vec<WorkItem>, limit: Option<usize>) -> Vec<WorkItem> {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

fn rows_to_items(
    reference: &str,
    rows: Vec<BTreeMap<String, String>>,
) -> Result<Vec<WorkItem>, DatasetError> {
    let total = rows.len();
    let items: Vec<WorkItem> = rows
        .into_iter()
        .enumerate()
        .filter_map(|(i, row)| WorkItem::from_row(i, row))
        .collect();
    if items.len() < total {
        log::warn!(
            "{}: skipped {} row(s) without usable text",
            reference,
            total - items.len()
        );
    }
    if items.is_empty() {
        return Err(DatasetError::Empty(reference.to_string()));
    }
    Ok(items)
}

/// Pick `\t` or `,` by counting occurrences in the first few lines.
fn sniff_delimiter(content: &str) -> char {
    let sample: String = content.lines().take(5).collect::<Vec<_>>().join("\n");
    let tabs = sample.matches('\t').count();
    let commas = sample.matches(',').count();
    if tabs > commas {
        '\t'
    } else {
        ','
    }
}

/// Split delimited text into records, honouring double-quoted fields (with `""` escapes
/// and embedded newlines).
fn split_records(content: &str, delimiter: char) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if record.iter().any(|f| !f.trim().is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    record.push(field);
    if record.iter().any(|f| !f.trim().is_empty()) {
        records.push(record);
    }
    Ok(records)
}

fn parse_delimited(
    reference: &str,
    content: &str,
) -> Result<Vec<BTreeMap<String, String>>, DatasetError> {
    let malformed = |reason: String| DatasetError::Malformed {
        reference: reference.to_string(),
        reason,
    };
    let content = content.trim_start_matches('\u{feff}');
    let delimiter = sniff_delimiter(content);
    let mut records = split_records(content, delimiter).map_err(malformed)?.into_iter();

    let Some(header) = records.next() else {
        return Err(DatasetError::Empty(reference.to_string()));
    };
    let headers: Vec<String> = header.iter().map(|h| h.trim().to_lowercase()).collect();

    let mut rows = Vec::new();
    for (line, values) in records.enumerate() {
        if values.len() > headers.len() {
            return Err(malformed(format!(
                "row {} has {} fields, header has {}",
                line + 1,
                values.len(),
                headers.len()
            )));
        }
        let row: BTreeMap<String, String> = headers
            .iter()
            .cloned()
            .zip(values.into_iter().map(|v| v.trim().to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

fn json_object_to_row(
    reference: &str,
    value: serde_json::Value,
) -> Result<BTreeMap<String, String>, DatasetError> {
    let serde_json::Value::Object(map) = value else {
        return Err(DatasetError::Malformed {
            reference: reference.to_string(),
            reason: "expected an array of objects".to_string(),
        });
    };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| {
            let v = match v {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Some((k.trim().to_lowercase(), v))
        })
        .collect())
}

fn parse_json_array(
    reference: &str,
    content: &str,
) -> Result<Vec<BTreeMap<String, String>>, DatasetError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_str(content).map_err(|e| DatasetError::Malformed {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;
    values
        .into_iter()
        .map(|v| json_object_to_row(reference, v))
        .collect()
}

fn parse_json_lines(
    reference: &str,
    content: &str,
) -> Result<Vec<BTreeMap<String, String>>, DatasetError> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            let value = serde_json::from_str(line).map_err(|e| DatasetError::Malformed {
                reference: reference.to_string(),
                reason: format!("line {}: {}", i + 1, e),
            })?;
            json_object_to_row(reference, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_csv_fields_keep_commas_and_newlines() {
        let rows = parse_delimited(
            "inline",
            "id,text,label\n1,\"Hello, world\",real\n2,\"Line one\nline \"\"two\"\"\",fake\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["text"], "Hello, world");
        assert_eq!(rows[1]["text"], "Line one\nline \"two\"");
    }

    #[test]
    fn tabs_win_when_more_frequent() {
        assert_eq!(sniff_delimiter("title\ttext\nA, B\tbody"), '\t');
        assert_eq!(sniff_delimiter("title,text\nA,body"), ',');
    }

    #[test]
    fn title_and_body_are_combined() {
        let mut row = BTreeMap::new();
        row.insert("title".to_string(), "Headline".to_string());
        row.insert("content".to_string(), "Body".to_string());
        let item = WorkItem::from_row(4, row).unwrap();
        assert_eq!(item.text, "Title: Headline\n\nContent: Body");
        assert_eq!(item.id, "4");
    }

    #[test]
    fn rows_without_text_are_skipped() {
        let items = rows_to_items(
            "inline",
            parse_delimited("inline", "id,text\n1,\n2,kept\n").unwrap(),
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "2");
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        let err = parse_delimited("bad.csv", "text\n\"open").unwrap_err();
        assert!(matches!(err, DatasetError::Malformed { .. }));
    }
}
