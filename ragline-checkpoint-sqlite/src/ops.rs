use std::convert::TryFrom;

use ragline_core::{
    Checkpoint, CheckpointMetadata, ConversationState, FailureMark, RunStatus, StoreError,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub(crate) fn step_param(step: u64) -> Result<i64, StoreError> {
    i64::try_from(step)
        .map_err(|_| StoreError::Backend("checkpoint step does not fit into i64".to_string()))
}

fn step_column(row: &SqliteRow) -> Result<u64, StoreError> {
    let step: i64 = row.try_get("step").map_err(crate::error::store_error)?;
    u64::try_from(step).map_err(|_| StoreError::Backend("checkpoint step is negative".to_string()))
}

fn text_column(row: &SqliteRow, column: &str) -> Result<String, StoreError> {
    row.try_get(column).map_err(crate::error::store_error)
}

fn status_column(row: &SqliteRow) -> Result<RunStatus, StoreError> {
    Ok(serde_json::from_str(&text_column(row, "status")?)?)
}

pub(crate) fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, StoreError> {
    let state = ConversationState::from_blob(&text_column(row, "state_blob")?)?;
    Ok(Checkpoint {
        run_id: text_column(row, "run_id")?,
        conversation_id: text_column(row, "conversation_id")?,
        step: step_column(row)?,
        state,
        next_node: text_column(row, "next_node")?,
        status: status_column(row)?,
        created_at: text_column(row, "created_at")?,
    })
}

pub(crate) fn metadata_from_row(row: &SqliteRow) -> Result<CheckpointMetadata, StoreError> {
    Ok(CheckpointMetadata {
        step: step_column(row)?,
        created_at: text_column(row, "created_at")?,
        next_node: text_column(row, "next_node")?,
        status: status_column(row)?,
    })
}

pub(crate) fn failure_from_row(row: &SqliteRow) -> Result<FailureMark, StoreError> {
    Ok(FailureMark {
        run_id: text_column(row, "run_id")?,
        step: step_column(row)?,
        reason: text_column(row, "reason")?,
        created_at: text_column(row, "created_at")?,
    })
}
