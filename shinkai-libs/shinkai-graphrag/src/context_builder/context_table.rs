use std::collections::{HashMap, HashSet};

use polars::{
    frame::DataFrame,
    io::SerWriter,
    prelude::{CsvWriter, DataType, NamedFrom, QuoteStyle},
    series::Series,
};

use crate::error::{GraphRagError, Result};

pub const IN_CONTEXT_COLUMN: &str = "in_context";

/// Context section name -> the records it was rendered from.
pub type ContextRecords = HashMap<String, DataFrame>;

/// The single byte separating cells of a rendered table.
pub fn csv_separator(column_delimiter: &str) -> Result<u8> {
    match column_delimiter.as_bytes() {
        [separator] if !matches!(separator, b'"' | b'\n' | b'\r') => Ok(*separator),
        _ => Err(GraphRagError::config(format!(
            "column_delimiter must be a single character other than a quote or line break, got {:?}",
            column_delimiter
        ))),
    }
}

/// One string column per header entry. Empty cells are stored as nulls.
pub fn records_to_dataframe(header: &[String], rows: &[Vec<String>]) -> Result<DataFrame> {
    if header.is_empty() {
        return Ok(DataFrame::default());
    }

    let data_series: Vec<Series> = header
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let values: Vec<Option<&str>> = rows
                .iter()
                .map(|row| row.get(index).map(|cell| cell.as_str()).filter(|cell| !cell.is_empty()))
                .collect();
            Series::new(name, values)
        })
        .collect();

    Ok(DataFrame::new(data_series)?)
}

/// Writes `df` as delimited text, quoting only the cells that hold the delimiter, a quote or a line break.
pub fn dataframe_to_csv(df: &mut DataFrame, column_delimiter: &str, include_header: bool) -> Result<String> {
    let separator = csv_separator(column_delimiter)?;
    let mut buffer: Vec<u8> = Vec::new();

    CsvWriter::new(&mut buffer)
        .include_header(include_header)
        .with_separator(separator)
        .with_quote_style(QuoteStyle::Necessary)
        .finish(df)?;

    String::from_utf8(buffer).map_err(|e| GraphRagError::InvalidData(e.to_string()))
}

pub fn render_rows(
    header: &[String],
    rows: &[Vec<String>],
    column_delimiter: &str,
    include_header: bool,
) -> Result<String> {
    let mut df = records_to_dataframe(header, rows)?;
    dataframe_to_csv(&mut df, column_delimiter, include_header)
}

/// Values of column `name` as text. Nulls read as empty strings.
pub fn column_values(df: &DataFrame, name: &str) -> Option<Vec<String>> {
    let column = df.column(name).ok()?.cast(&DataType::String).ok()?;
    let values = column.str().ok()?;
    Some(
        values
            .into_iter()
            .map(|value| value.unwrap_or_default().to_string())
            .collect(),
    )
}

pub fn with_in_context_flag(mut df: DataFrame, value: bool) -> Result<DataFrame> {
    let flags = Series::new(IN_CONTEXT_COLUMN, vec![value; df.height()]);
    df.with_column(flags)?;
    Ok(df)
}

/// Tags every record with whether its `id` appears in `included`.
pub fn with_in_context_ids(mut df: DataFrame, included: &HashSet<String>) -> Result<DataFrame> {
    let flags: Vec<bool> = match column_values(&df, "id") {
        Some(ids) => ids.iter().map(|id| included.contains(id)).collect(),
        None => vec![false; df.height()],
    };
    df.with_column(Series::new(IN_CONTEXT_COLUMN, flags))?;
    Ok(df)
}

/// Replaces each in-context frame with its full candidate frame, tagged with `in_context`.
pub fn merge_candidate_context(context_records: &mut ContextRecords, candidates: ContextRecords) -> Result<()> {
    for (key, candidate) in candidates {
        let merged = match context_records.remove(&key) {
            None => with_in_context_flag(candidate, false)?,
            Some(existing) => {
                let included: Option<HashSet<String>> =
                    column_values(&existing, "id").map(|ids| ids.into_iter().collect());
                match included {
                    Some(included) if candidate.column("id").is_ok() => with_in_context_ids(candidate, &included)?,
                    _ => with_in_context_flag(existing, true)?,
                }
            }
        };
        context_records.insert(key, merged);
    }
    Ok(())
}
