//! Builders for row payloads and CSV inputs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rowpress::RowData;

/// Column the scripted renderer reads its behaviour from.
pub const MODE: &str = "mode";

/// A row that renders fine, with the given reference.
pub fn ok_row(reference: &str) -> RowData {
    RowData::new(vec![
        ("reference".to_string(), reference.to_string()),
        ("name".to_string(), format!("Customer {}", reference)),
    ])
}

/// A row whose render behaviour is scripted: `fail`, `flaky`, `panic`,
/// `empty` or `block`.
pub fn scripted_row(reference: &str, mode: &str) -> RowData {
    RowData::new(vec![
        ("reference".to_string(), reference.to_string()),
        (MODE.to_string(), mode.to_string()),
    ])
}

/// `count` good rows referenced `R-1`, `R-2`, ...
pub fn ok_rows(count: usize) -> Vec<RowData> {
    (1..=count).map(|i| ok_row(&format!("R-{}", i))).collect()
}

/// Writes `content` to `name` inside `dir` and returns the path.
pub fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write CSV fixture");
    path
}
