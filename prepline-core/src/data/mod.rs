//! Table model, type inference, and file sources.

pub mod schema;
pub mod source;
pub mod table;

pub use schema::{infer_column_type, parse_datetime, table_from_rows};
pub use source::{CsvSource, JsonSource, JsonlSource, SourceInfo, TableSource, source_for_path};
pub use table::{Cell, Column, ColumnData, DataType, Table, TableBuilder};
