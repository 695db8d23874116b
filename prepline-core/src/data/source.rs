//! Table sources for loading datasets from files.

use crate::data::schema::{parse_field, table_from_rows};
use crate::data::table::Table;
use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Information about a data source for run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub source_type: String,
    pub location: String,
    pub accessed_at: chrono::DateTime<chrono::Utc>,
}

/// Trait for loading a table from a source.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// Load the table, optionally limiting the number of rows.
    async fn load(&self, limit: Option<usize>) -> Result<Table, PipelineError>;

    /// Metadata about this source.
    fn source_info(&self) -> SourceInfo;
}

/// Pick a source implementation from the file extension.
pub fn source_for_path(path: &Path) -> Result<Box<dyn TableSource>, PipelineError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => Ok(Box::new(CsvSource::new(path))),
        "tsv" => Ok(Box::new(CsvSource {
            path: path.to_path_buf(),
            delimiter: b'\t',
        })),
        "json" => Ok(Box::new(JsonSource {
            path: path.to_path_buf(),
        })),
        "jsonl" | "ndjson" => Ok(Box::new(JsonlSource {
            path: path.to_path_buf(),
        })),
        _ => Err(PipelineError::dataset(format!(
            "Unsupported file format: {}",
            path.display()
        ))),
    }
}

fn info(source_type: &str, path: &Path) -> SourceInfo {
    SourceInfo {
        source_type: source_type.to_string(),
        location: path.display().to_string(),
        accessed_at: chrono::Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// CsvSource
// ---------------------------------------------------------------------------

/// CSV file source. The first record is the header.
///
/// Quoted fields are kept as text; only unquoted fields go through type
/// inference, so `"007"` stays a string while `007` parses as a number.
pub struct CsvSource {
    pub path: PathBuf,
    pub delimiter: u8,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }
}

/// Flag which fields of the raw record starting at `start` were quoted.
///
/// The reader has already split the record; this only walks the raw bytes
/// far enough to see whether each field opens with a quote.
fn quoted_fields(raw: &[u8], start: usize, fields: usize, delimiter: u8) -> Vec<bool> {
    let mut flags = Vec::with_capacity(fields);
    let mut i = start;
    while matches!(raw.get(i), Some(b'\r' | b'\n')) {
        i += 1;
    }
    for _ in 0..fields {
        let quoted = raw.get(i) == Some(&b'"');
        if quoted {
            i += 1;
            while let Some(&b) = raw.get(i) {
                i += 1;
                if b == b'"' {
                    if raw.get(i) == Some(&b'"') {
                        i += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        while let Some(&b) = raw.get(i) {
            if b == delimiter || b == b'\n' || b == b'\r' {
                break;
            }
            i += 1;
        }
        // past the delimiter
        i += 1;
        flags.push(quoted);
    }
    flags
}

#[async_trait]
impl TableSource for CsvSource {
    async fn load(&self, limit: Option<usize>) -> Result<Table, PipelineError> {
        let raw = tokio::fs::read(&self.path).await?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(raw.as_slice());

        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if columns.is_empty() {
            return Err(PipelineError::dataset("Empty CSV file"));
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            if limit.is_some_and(|max| rows.len() >= max) {
                break;
            }
            let record = record?;
            if record.len() != columns.len() {
                return Err(PipelineError::dataset(format!(
                    "CSV record on line {} has {} fields, header has {}",
                    record.position().map_or(0, |p| p.line()),
                    record.len(),
                    columns.len()
                )));
            }
            let start = record.position().map_or(0, |p| p.byte() as usize);
            let quoted = quoted_fields(&raw, start, record.len(), self.delimiter);
            let row: Vec<Value> = record
                .iter()
                .zip(quoted)
                .map(|(field, quoted)| {
                    if quoted {
                        Value::String(field.to_string())
                    } else {
                        parse_field(field)
                    }
                })
                .collect();
            rows.push(row);
        }

        table_from_rows(&columns, &rows)
    }

    fn source_info(&self) -> SourceInfo {
        info("csv", &self.path)
    }
}

// ---------------------------------------------------------------------------
// JsonSource
// ---------------------------------------------------------------------------

/// JSON file source: an array of objects, or a single object.
pub struct JsonSource {
    pub path: PathBuf,
}

/// Collect column names in first-seen order across all records.
fn record_columns(items: &[Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for item in items {
        if let Value::Object(map) = item {
            for key in map.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns
}

fn records_to_table(items: &[Value]) -> Result<Table, PipelineError> {
    if items.iter().any(|item| !item.is_object()) {
        return Err(PipelineError::dataset("Every record must be a JSON object"));
    }
    let columns = record_columns(items);
    let rows: Vec<Vec<Value>> = items
        .iter()
        .map(|item| {
            columns
                .iter()
                .map(|col| item.get(col).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    table_from_rows(&columns, &rows)
}

#[async_trait]
impl TableSource for JsonSource {
    async fn load(&self, limit: Option<usize>) -> Result<Table, PipelineError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let value: Value = serde_json::from_str(&content)?;

        let mut items = match value {
            Value::Array(arr) => arr,
            obj @ Value::Object(_) => vec![obj],
            _ => return Err(PipelineError::dataset("JSON must be an array or object")),
        };
        if let Some(max) = limit {
            items.truncate(max);
        }
        records_to_table(&items)
    }

    fn source_info(&self) -> SourceInfo {
        info("json", &self.path)
    }
}

// ---------------------------------------------------------------------------
// JsonlSource
// ---------------------------------------------------------------------------

/// JSON Lines source, one JSON object per line.
pub struct JsonlSource {
    pub path: PathBuf,
}

#[async_trait]
impl TableSource for JsonlSource {
    async fn load(&self, limit: Option<usize>) -> Result<Table, PipelineError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut items = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if limit.is_some_and(|max| items.len() >= max) {
                break;
            }
            let item: Value = serde_json::from_str(line).map_err(|e| {
                PipelineError::dataset(format!("Invalid JSON on line {}: {e}", line_no + 1))
            })?;
            items.push(item);
        }
        records_to_table(&items)
    }

    fn source_info(&self) -> SourceInfo {
        info("jsonl", &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::table::{Cell, DataType};
    use tempfile::TempDir;

    #[test]
    fn test_quoted_fields_flags() {
        let raw = br#"a,"b,c","say ""hi""",d"#;
        assert_eq!(quoted_fields(raw, 0, 4, b','), vec![false, true, true, false]);
    }

    #[tokio::test]
    async fn test_csv_quoted_delimiters_and_escapes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.csv");
        std::fs::write(&path, "id,note\n1,\"x, y\"\n2,\"say \"\"hi\"\"\"\n").unwrap();

        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        let note = &table.column("note").unwrap().data;
        assert_eq!(note.cell(0), Cell::String("x, y".into()));
        assert_eq!(note.cell(1), Cell::String("say \"hi\"".into()));
        assert_eq!(table.column("id").unwrap().dtype(), DataType::Integer);
    }

    #[tokio::test]
    async fn test_csv_quoted_newline_stays_in_one_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("multiline.csv");
        std::fs::write(&path, "id,note\n1,\"line one\nline two\"\n2,plain\n").unwrap();

        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        assert_eq!(table.row_count(), 2);
        let note = &table.column("note").unwrap().data;
        assert_eq!(note.cell(0), Cell::String("line one\nline two".into()));
        assert_eq!(note.cell(1), Cell::String("plain".into()));
    }

    #[tokio::test]
    async fn test_csv_quoted_digits_keep_leading_zeros() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("zips.csv");
        std::fs::write(&path, "zip,count\n\"007\",7\n\"010\",10\n").unwrap();

        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        let zip = table.column("zip").unwrap();
        assert_eq!(zip.dtype(), DataType::String);
        assert_eq!(zip.data.cell(0), Cell::String("007".into()));
        assert_eq!(zip.data.cell(1), Cell::String("010".into()));
        assert_eq!(table.column("count").unwrap().dtype(), DataType::Integer);
    }

    #[tokio::test]
    async fn test_csv_ragged_record_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ragged.csv");
        std::fs::write(&path, "a,b\n1,2\n3\n").unwrap();
        let err = CsvSource::new(&path).load(None).await.unwrap_err();
        assert!(err.to_string().contains("has 1 fields, header has 2"));
    }

    #[tokio::test]
    async fn test_tsv_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.tsv");
        std::fs::write(&path, "a\tb\r\n1\t\"x\ty\"\r\n2\tz\r\n").unwrap();
        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column("b").unwrap().data.cell(0), Cell::String("x\ty".into()));
    }

    #[tokio::test]
    async fn test_csv_source_infers_types() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.csv");
        std::fs::write(&path, "name,age,score\nAlice,30,1.5\nBob,,2.0\n").unwrap();

        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column("age").unwrap().dtype(), DataType::Integer);
        assert_eq!(table.column("score").unwrap().dtype(), DataType::Float);
        assert_eq!(table.column("age").unwrap().data.missing_count(), 1);
    }

    #[tokio::test]
    async fn test_csv_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.csv");
        std::fs::write(&path, "x\n1\n2\n3\n").unwrap();
        let table = CsvSource::new(&path).load(Some(2)).await.unwrap();
        assert_eq!(table.row_count(), 2);
    }

    #[tokio::test]
    async fn test_json_source_union_of_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.json");
        std::fs::write(&path, r#"[{"a": 1}, {"a": 2, "b": "x"}]"#).unwrap();
        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        assert_eq!(table.column_names(), vec!["a", "b"]);
        assert_eq!(table.column("b").unwrap().data.missing_count(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rows.jsonl");
        std::fs::write(&path, "{\"t\": \"2024-01-01\", \"v\": 1.0}\n\n{\"t\": \"2024-01-02\", \"v\": 2.0}\n").unwrap();
        let table = source_for_path(&path).unwrap().load(None).await.unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column("t").unwrap().dtype(), DataType::DateTime);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = source_for_path(Path::new("data.parquet")).err().unwrap();
        assert!(err.to_string().contains("Unsupported file format"));
    }
}
