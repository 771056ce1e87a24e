//! Torn-page repair from staging files
//!
//! Runs once at engine start, before any writer opens its staging buffer.
//! A staging file whose batch index is not -1 holds a batch that was made
//! durable but may not have fully reached the data file. Each of its pages
//! is written back when the data file copy is torn, missing or older.

use std::fs;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::{info, warn};

use crate::error::{FlushError, FlushResult};
use crate::page::{page_lsn, verify_page_checksum};
use crate::staging::{mark_file_applied, read_staging_file, StagingHeader, APPLIED_BATCH};
use crate::store::PageStore;
use crate::types::BlockNumber;

/// What recovery found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Staging files examined
    pub files_scanned: usize,
    /// Batches that were durable but not marked applied
    pub batches_replayed: usize,
    /// Pages written back to the data file
    pub pages_restored: usize,
    /// Staged pages the data file already held intact and up to date
    pub pages_skipped: usize,
    /// Batches dropped because their own CRC failed
    pub discarded_batches: usize,
    /// A replayed batch held a layout-sensitive page
    pub layout_sensitive: bool,
}

impl RecoveryReport {
    /// True if recovery changed nothing.
    pub fn is_clean(&self) -> bool {
        self.batches_replayed == 0 && self.discarded_batches == 0
    }
}

/// List staging files in `dir`, sorted by name. Missing dir = none.
fn staging_files(dir: &Path) -> FlushResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(FlushError::io_at(dir, &e, "Failed to read staging directory")),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| FlushError::io_at(dir, &e, "Failed to read staging directory"))?;
        let path = entry.path();
        let is_staging = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("stage-") && n.ends_with(".dw"));
        if is_staging {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Replay every unapplied staging batch in `dir` into `store`.
pub fn recover_staging(dir: &Path, store: &dyn PageStore) -> FlushResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let page_size = store.page_size();

    // newest staged image per block across all writers
    let mut candidates: HashMap<BlockNumber, Vec<u8>> = HashMap::new();
    let mut pending: Vec<(PathBuf, StagingHeader)> = Vec::new();

    for path in staging_files(dir)? {
        report.files_scanned += 1;
        let batch = match read_staging_file(&path) {
            Ok(Some(batch)) => batch,
            Ok(None) => continue,
            Err(FlushError::StagingCorrupted { offset, reason, .. }) => {
                warn!(path = %path.display(), offset, reason = %reason, "discarding torn staging batch");
                report.discarded_batches += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        if batch.header.batch_index == APPLIED_BATCH {
            continue;
        }
        if batch.header.page_size as usize != page_size {
            return Err(FlushError::PageSizeMismatch {
                expected: page_size,
                actual: batch.header.page_size as usize,
            });
        }

        report.batches_replayed += 1;
        report.layout_sensitive |= batch.header.layout_sensitive();
        for (block, page) in batch.pages {
            if verify_page_checksum(&page, block).is_err() {
                warn!(path = %path.display(), %block, "staged page fails its checksum, skipping");
                continue;
            }
            let newer = candidates
                .get(&block)
                .map_or(true, |existing| page_lsn(&page) >= page_lsn(existing));
            if newer {
                candidates.insert(block, page);
            }
        }
        pending.push((path, batch.header));
    }

    let mut on_disk = vec![0u8; page_size];
    for (block, staged) in &candidates {
        let present = store.read_page(*block, &mut on_disk)?;
        let replay = !present
            || verify_page_checksum(&on_disk, *block).is_err()
            || page_lsn(&on_disk) < page_lsn(staged);
        if replay {
            store.write_page(*block, staged)?;
            report.pages_restored += 1;
        } else {
            report.pages_skipped += 1;
        }
    }

    if report.pages_restored > 0 {
        store.sync()?;
    }
    for (path, header) in &pending {
        mark_file_applied(path, header)?;
    }

    if report.is_clean() {
        info!(files = report.files_scanned, "staging recovery: nothing to replay");
    } else {
        info!(
            files = report.files_scanned,
            batches = report.batches_replayed,
            restored = report.pages_restored,
            skipped = report.pages_skipped,
            discarded = report.discarded_batches,
            layout_sensitive = report.layout_sensitive,
            "staging recovery finished"
        );
    }
    Ok(report)
}
