//! Pull handler: streams change log entries above a client's cursor in seq
//! order, bounded batches, with in-batch compaction.

use std::collections::HashMap;

use overhaul_core::models::{now_millis, ChangeLogEntry};
use overhaul_core::protocol::{PullRequest, PullResponse};
use overhaul_core::{SyncError, SyncResult};
use tracing::instrument;

use crate::{change_log, cursors, AppState};

#[instrument(skip_all, fields(client_id = %request.client_id))]
pub async fn handle_pull(state: &AppState, request: PullRequest) -> SyncResult<PullResponse> {
    if request.client_id.is_empty() {
        return Err(SyncError::validation("client_id must not be empty"));
    }

    let max_batch = state.config.pull_max_batch;
    let limit = request.limit.unwrap_or(max_batch).clamp(1, max_batch);

    let since_seq = match request.since_seq {
        Some(seq) => seq,
        None => cursors::get(&state.pool, &request.client_id)
            .await?
            .map(|s| s.last_pulled_server_seq)
            .unwrap_or(0),
    };

    let entries = change_log::range(&state.pool, since_seq, limit).await?;
    let has_more = entries.len() as i64 == limit;
    // An empty batch clamps against the committed maximum so a cursor seeded
    // from a bogus since_seq can never run ahead of the log.
    let next_seq = match entries.last() {
        Some(entry) => entry.seq,
        None => since_seq.min(change_log::max_seq(&state.pool).await?),
    };
    let entries = compact(entries);

    // The cursor only advances once the response is on its way out; a
    // cancelled request re-reads from the same position.
    cursors::touch_pull(&state.pool, &request.client_id, next_seq, now_millis()).await?;

    Ok(PullResponse {
        ok: true,
        entries,
        next_seq,
        has_more,
    })
}

/// Drop entries superseded later in the same batch: only the latest entry per
/// `(table, row_id)` survives, at its original position, so seq order is
/// preserved.
pub fn compact(entries: Vec<ChangeLogEntry>) -> Vec<ChangeLogEntry> {
    let mut keep = vec![true; entries.len()];
    let mut latest: HashMap<(&str, &str), usize> = HashMap::new();

    for (index, entry) in entries.iter().enumerate() {
        if let Some(previous) = latest.insert((entry.table.as_str(), entry.row_id.as_str()), index)
        {
            keep[previous] = false;
        }
    }

    entries
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, keep)| keep.then_some(entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use overhaul_core::models::ChangeOp;
    use serde_json::json;

    fn entry(seq: i64, table: &str, row_id: &str, updated_at: i64) -> ChangeLogEntry {
        ChangeLogEntry {
            seq,
            table: table.to_string(),
            row_id: row_id.to_string(),
            op: ChangeOp::Upsert,
            payload: json!({"id": row_id, "updated_at": updated_at}),
            created_at: updated_at,
        }
    }

    #[test]
    fn compaction_keeps_only_the_latest_entry_per_row() {
        let compacted = compact(vec![
            entry(1, "attribute_values", "V", 10),
            entry(2, "attribute_values", "V", 11),
            entry(3, "attribute_values", "V", 12),
        ]);

        assert_eq!(compacted.len(), 1);
        assert_eq!(compacted[0].seq, 3);
        assert_eq!(compacted[0].payload["updated_at"], 12);
    }

    #[test]
    fn compaction_does_not_reorder_survivors() {
        let compacted = compact(vec![
            entry(1, "entities", "A", 1),
            entry(2, "notes", "N", 2),
            entry(3, "entities", "A", 3),
            entry(4, "notes", "M", 4),
        ]);

        let seqs: Vec<i64> = compacted.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn compaction_distinguishes_same_id_across_tables() {
        let compacted = compact(vec![
            entry(1, "entities", "X", 1),
            entry(2, "notes", "X", 2),
        ]);
        assert_eq!(compacted.len(), 2);
    }

    #[test]
    fn compaction_of_empty_batch_is_empty() {
        assert!(compact(Vec::new()).is_empty());
    }
}
