//! Paged storage scanning.
//!
//! A [`PagedScanner`] walks one keyed map in bounded pages through the ledger
//! query interface. The scan is finite and restartable only from the
//! beginning; a failed page fetch surfaces as [`ScanError`] carrying the last
//! successful cursor so the caller can decide between resuming and retrying
//! the whole scan. Dropping the scanner abandons the scan: no further pages
//! are requested and nothing is left half-mutated, partial results stay with
//! the caller.

use crate::client::{Cursor, KeyTuple, LedgerQuery, MapId, QueryError, RawValue, ScalarKey};
use crate::snapshot::StorageSnapshot;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("scan of {map} failed at cursor {cursor:?}: {source}")]
pub struct ScanError {
    pub map: &'static str,
    /// Resume point: the cursor whose fetch failed, which is the next-cursor
    /// of the last successful page. `None` when the very first page failed,
    /// in which case resuming and restarting are the same thing.
    pub cursor: Option<Cursor>,
    #[source]
    pub source: QueryError,
}

pub struct PagedScanner<'a> {
    ledger: &'a dyn LedgerQuery,
    map: MapId,
    prefix: KeyTuple,
    page_size: usize,
    cursor: Option<Cursor>,
    done: bool,
}

impl<'a> PagedScanner<'a> {
    pub fn new(ledger: &'a dyn LedgerQuery, map: MapId, prefix: KeyTuple, page_size: usize) -> Self {
        Self {
            ledger,
            map,
            prefix,
            page_size: page_size.max(1),
            cursor: None,
            done: false,
        }
    }

    /// Resume a scan from a cursor previously reported by [`ScanError`].
    /// Only meaningful within the same process: cursors do not survive
    /// restarts.
    pub fn resume(
        ledger: &'a dyn LedgerQuery,
        map: MapId,
        prefix: KeyTuple,
        page_size: usize,
        cursor: Option<Cursor>,
    ) -> Self {
        Self {
            ledger,
            map,
            prefix,
            page_size: page_size.max(1),
            cursor,
            done: false,
        }
    }

    /// Fetch the next page. `Ok(None)` once the map is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<(KeyTuple, RawValue)>>, ScanError> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .ledger
            .scan_page(self.map, &self.prefix, self.cursor, self.page_size)
            .await
            .map_err(|source| ScanError {
                map: self.map.name(),
                cursor: self.cursor,
                source,
            })?;

        match page.next {
            Some(next) if !page.entries.is_empty() => self.cursor = Some(next),
            _ => self.done = true,
        }
        if page.entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(page.entries))
    }

    /// Drain the remaining pages into one vector.
    pub async fn collect_all(mut self) -> Result<Vec<(KeyTuple, RawValue)>, ScanError> {
        let mut out = Vec::new();
        while let Some(mut entries) = self.next_page().await? {
            out.append(&mut entries);
        }
        Ok(out)
    }
}

/// Scan one map fully into a vector.
pub async fn collect_map(
    ledger: &dyn LedgerQuery,
    map: MapId,
    prefix: &[ScalarKey],
    page_size: usize,
) -> Result<Vec<(KeyTuple, RawValue)>, ScanError> {
    PagedScanner::new(ledger, map, prefix.to_vec(), page_size)
        .collect_all()
        .await
}

/// Scan one map fully into a point-in-time snapshot.
pub async fn collect_snapshot(
    ledger: &dyn LedgerQuery,
    map: MapId,
    prefix: &[ScalarKey],
    page_size: usize,
) -> Result<StorageSnapshot, ScanError> {
    let entries = collect_map(ledger, map, prefix, page_size).await?;
    let mut snapshot = StorageSnapshot::new();
    for (key, value) in entries {
        snapshot.insert(map, key, value);
    }
    Ok(snapshot)
}
