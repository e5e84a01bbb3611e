//! Initial load: newest snapshot plus the deltas after it.

use std::time::Instant;

use kvload_blob::{BlobStorageClient, ListOptions};
use kvload_core::{FileDescriptor, LoadError, LoadResult};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::apply::{Applier, OnRecordError, Source};

/// Files to load, in application order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    pub snapshot: Option<(FileDescriptor, String)>,
    pub deltas: Vec<(FileDescriptor, String)>,
}

impl LoadPlan {
    /// Highest logical timestamp covered by the plan, 0 when empty.
    pub fn watermark(&self) -> u64 {
        let snap = self.snapshot.as_ref().map_or(0, |(fd, _)| fd.logical_timestamp());
        let delta = self.deltas.last().map_or(0, |(fd, _)| fd.logical_timestamp());
        snap.max(delta)
    }

    pub fn files(&self) -> impl Iterator<Item = &(FileDescriptor, String)> {
        self.snapshot.iter().chain(self.deltas.iter())
    }
}

/// Pick the latest snapshot and the deltas strictly newer than it, ascending.
/// Names that do not parse are skipped with a warning. Of several deltas with
/// one timestamp only the first by name is kept.
pub fn plan_load(names: &[String]) -> LoadPlan {
    let mut snapshot: Option<(FileDescriptor, String)> = None;
    let mut deltas = Vec::new();
    for name in names {
        let fd = match FileDescriptor::parse_object_name(name) {
            Ok(fd) => fd,
            Err(e) => {
                warn!(name = %name, error = %e, "bootstrap: ignoring object");
                continue;
            }
        };
        if fd.is_snapshot() {
            let newer = snapshot.as_ref().map_or(true, |(cur, _)| fd.logical_timestamp() > cur.logical_timestamp());
            if newer {
                snapshot = Some((fd, name.clone()));
            }
        } else {
            deltas.push((fd, name.clone()));
        }
    }
    let floor = snapshot.as_ref().map_or(0, |(fd, _)| fd.logical_timestamp());
    deltas.retain(|(fd, _)| snapshot.is_none() || fd.is_newer_than(floor));
    deltas.sort_by_key(|(fd, name)| (fd.logical_timestamp(), name.clone()));
    let mut unique: Vec<(FileDescriptor, String)> = Vec::with_capacity(deltas.len());
    for (fd, name) in deltas {
        if let Some((last, kept)) = unique.last() {
            if last.logical_timestamp() == fd.logical_timestamp() {
                warn!(name = %name, kept = %kept, "bootstrap: duplicate delta timestamp; ignoring");
                continue;
            }
        }
        unique.push((fd, name));
    }
    LoadPlan { snapshot, deltas: unique }
}

/// Run the initial load and return the resulting watermark. Any failure is
/// fatal to the caller.
pub(crate) async fn run(
    client: &dyn BlobStorageClient,
    bucket: &str,
    prefix: Option<&str>,
    applier: &Applier,
    ct: &CancellationToken,
) -> LoadResult<u64> {
    let t0 = Instant::now();
    let opts = ListOptions { prefix: prefix.map(str::to_string), start_after: None };
    let names = client.list(bucket, &opts).await?;
    let plan = plan_load(&names);
    info!(
        bucket,
        listed = names.len(),
        snapshot = ?plan.snapshot.as_ref().map(|(_, n)| n.as_str()),
        deltas = plan.deltas.len(),
        "bootstrap: plan ready"
    );

    for (fd, name) in plan.files() {
        let source = if fd.is_snapshot() { Source::Snapshot } else { Source::Delta };
        let f0 = Instant::now();
        let blob = client.read(bucket, name).await?;
        let stats = applier
            .apply_blob(source, name, blob, OnRecordError::Abort, ct)
            .await
            .map_err(|e| {
                error!(name = %name, error = %e, "bootstrap: file failed");
                e
            })?;
        if let Some(ts) = stats.max_commit_time {
            applier.cache().remove_deleted_keys(ts);
        }
        counter!("loader_files_loaded_total", 1u64, "source" => source.as_str());
        histogram!("loader_file_load_ms", f0.elapsed().as_millis() as f64, "source" => source.as_str());
        info!(
            name = %name,
            applied = stats.applied,
            stale = stats.stale,
            skipped_shard = stats.skipped_shard,
            took_ms = %f0.elapsed().as_millis(),
            "bootstrap: file loaded"
        );
    }

    if ct.is_cancelled() {
        return Err(LoadError::ShutdownInProgress);
    }
    let watermark = plan.watermark();
    info!(watermark, files = plan.files().count(), took_ms = %t0.elapsed().as_millis(), "bootstrap: done");
    Ok(watermark)
}
