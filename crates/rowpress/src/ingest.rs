//! CSV ingest: one row payload per data record.

use std::io::Read;
use std::path::Path;

use crate::error::IngestError;
use crate::model::RowData;

/// Result of parsing an input file.
#[derive(Debug, Clone)]
pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub rows: Vec<RowData>,
    /// Records dropped because their field count did not match the header.
    pub skipped: usize,
}

/// Parses CSV from a reader. The first record is the header.
///
/// Records with a different number of fields than the header are skipped.
/// When a header name repeats, the later column's value wins.
pub fn parse_csv<R: Read>(reader: R) -> Result<ParsedCsv, IngestError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader.headers()?.iter().map(String::from).collect();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(IngestError::MissingHeader);
    }

    let mut rows = Vec::new();
    let mut skipped = 0;
    for (record_idx, record) in csv_reader.records().enumerate() {
        let record = record?;
        if record.len() != headers.len() {
            tracing::warn!(
                record = record_idx + 1,
                expected = headers.len(),
                found = record.len(),
                "Skipping CSV record with mismatched field count"
            );
            skipped += 1;
            continue;
        }

        let mut fields: Vec<(String, String)> = Vec::with_capacity(headers.len());
        for (header, value) in headers.iter().zip(record.iter()) {
            match fields.iter_mut().find(|(name, _)| name == header) {
                Some(existing) => existing.1 = value.to_string(),
                None => fields.push((header.clone(), value.to_string())),
            }
        }
        rows.push(RowData::new(fields));
    }

    if rows.is_empty() {
        return Err(IngestError::Empty);
    }

    tracing::debug!(rows = rows.len(), skipped, "Parsed CSV input");

    Ok(ParsedCsv {
        headers,
        rows,
        skipped,
    })
}

/// Parses a CSV file from disk.
pub fn parse_csv_file(path: &Path) -> Result<ParsedCsv, IngestError> {
    let file = std::fs::File::open(path).map_err(|e| IngestError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_csv(std::io::BufReader::new(file))
}
