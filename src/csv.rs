use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::model::{Action, Identity};
use crate::Amount;

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("{path}: failed to open: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized action '{action}'")]
    UnrecognizedAction { line: usize, action: String },

    #[error("line {line}: invalid total price '{value}'")]
    InvalidPrice { line: usize, value: String },

    #[error("failed to write results: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush results: {0}")]
    Flush(#[from] io::Error),
}

/// One line-item action as read from the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRow {
    pub line: usize,
    pub request_id: String,
    pub line_item_id: String,
    pub requester_id: String,
    pub fund_code: Option<String>,
    pub total_price: Option<Amount>,
    pub actor_id: String,
    pub action: Action,
}

#[derive(Debug, Deserialize)]
struct InputRow {
    request_id: String,
    line_item_id: String,
    requester_id: String,
    fund_code: Option<String>,
    total_price: Option<String>,
    actor_id: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct DirectoryRow {
    actor_id: String,
    email: String,
    roles: Option<String>,
}

/// One routing outcome as written to the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRow {
    pub request_id: String,
    pub line_item_id: String,
    pub action: String,
    pub actor_id: String,
    pub status: String,
    pub claimed_by: String,
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })
}

/// Read line-item actions from a csv file
pub fn read_actions(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<ActionRow, CsvError>>, CsvError> {
    let reader = reader(path.as_ref())?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let action = row
                .action
                .parse::<Action>()
                .map_err(|_| CsvError::UnrecognizedAction {
                    line,
                    action: row.action.clone(),
                })?;
            let total_price = match row.total_price.filter(|p| !p.is_empty()) {
                Some(value) => Some(
                    value
                        .parse::<Amount>()
                        .map_err(|_| CsvError::InvalidPrice { line, value })?,
                ),
                None => None,
            };
            Ok(ActionRow {
                line,
                request_id: row.request_id,
                line_item_id: row.line_item_id,
                requester_id: row.requester_id,
                fund_code: row.fund_code.filter(|f| !f.is_empty()),
                total_price,
                actor_id: row.actor_id,
                action,
            })
        }))
}

/// Read directory entries (`actor_id,email,roles`, roles separated by `;`)
pub fn read_directory(path: impl AsRef<Path>) -> Result<Vec<Identity>, CsvError> {
    let reader = reader(path.as_ref())?;

    reader
        .into_deserialize::<DirectoryRow>()
        .enumerate()
        .map(|(idx, result)| {
            let row = result.map_err(|source| CsvError::Parse {
                line: idx + 2,
                source,
            })?;
            let roles = row.roles.unwrap_or_default();
            Ok(Identity::new(
                row.actor_id,
                row.email,
                roles
                    .split(';')
                    .map(str::trim)
                    .filter(|role| !role.is_empty()),
            ))
        })
        .collect()
}

/// Write routing outcomes in csv format
pub fn write_results(
    writer: impl io::Write,
    rows: impl IntoIterator<Item = OutputRow>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(&row)?;
    }
    writer.flush()?;
    Ok(())
}
