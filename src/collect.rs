//! The collector pass: reconcile outstanding remote work.
//!
//! For every in-flight remote task this polls the owning node, retrieves
//! and verifies finished results, feeds the cache, retries bounded
//! failures, reclaims stale remote entries, and repairs jobs whose remote
//! queue was lost. All bookkeeping lands back in the TaskStore; the pass
//! holds no state of its own and can be killed and rerun at any point.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde_json::Value;

use crate::config::QdConfig;
use crate::dispatch::epoch_now;
use crate::error::{QdError, Result};
use crate::fasta;
use crate::flavor::{flavor_for, ServerFlavor};
use crate::rpc::{NodeClient, NodeConnector, RemoteStatus};
use crate::store::cache::unpack_tar_gz;
use crate::store::{CacheStore, RemoteTask, SetKind, Tag, TaskStore};

enum FetchOutcome {
    /// Result installed and verified.
    Installed { runtime: f64 },
    /// Download or extraction failed; poll again next pass.
    FetchFailed,
    /// The node finished but the result does not pass the completeness
    /// check; counts against the resubmission budget.
    Incomplete,
}

pub struct ResultCollector<'a> {
    cfg: &'a QdConfig,
    cache: &'a CacheStore,
    connector: &'a dyn NodeConnector,
    flavor: &'static dyn ServerFlavor,
}

impl<'a> ResultCollector<'a> {
    pub fn new(cfg: &'a QdConfig, cache: &'a CacheStore, connector: &'a dyn NodeConnector) -> Self {
        Self {
            cfg,
            cache,
            connector,
            flavor: flavor_for(cfg.server),
        }
    }

    /// Run one collector pass for one job.
    pub async fn collect(&self, job_id: &str) -> Result<()> {
        let store = TaskStore::open(self.cfg.job_dir(job_id));
        let out_dir = store.output_dir();
        std::fs::create_dir_all(&out_dir).map_err(|e| QdError::io(&out_dir, e))?;
        let tmp = store.tmp_dir();
        std::fs::create_dir_all(&tmp).map_err(|e| QdError::io(&tmp, e))?;

        let queue = store.read_remote_queue();
        if queue.is_empty() {
            // Nothing in flight. If sequences are unaccounted for, the
            // queue was lost; regenerate the work list.
            return self.repair_lost_tasks(&store);
        }

        let mut clients: HashMap<String, Box<dyn NodeClient>> = HashMap::new();
        for node in queue.iter().map(|t| t.node.clone()).collect::<BTreeSet<_>>() {
            match self.connector.connect(&node).await {
                Ok(client) => {
                    clients.insert(node, client);
                }
                Err(e) => {
                    tracing::warn!(node = %node, error = %e, "Node unreachable, its tasks stay queued");
                }
            }
        }

        let key_params = self.key_params(&store);
        let mut retry = store.read_retry_counts();
        let now = epoch_now();

        let mut finished_records: Vec<String> = Vec::new();
        let mut finished_idx: Vec<usize> = Vec::new();
        let mut failed_idx: Vec<usize> = Vec::new();
        let mut resubmit_idx: Vec<usize> = Vec::new();
        let mut keep: Vec<RemoteTask> = Vec::new();

        for task in queue {
            let client = match clients.get(&task.node) {
                Some(c) => c,
                None => {
                    keep.push(task);
                    continue;
                }
            };
            let check = match client.check_job(&task.remote_id).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(
                        job_id = store.job_id(),
                        remote_id = %task.remote_id,
                        node = %task.node,
                        error = %e,
                        "Status check failed, keeping task queued"
                    );
                    keep.push(task);
                    continue;
                }
            };

            if check.status != RemoteStatus::Wait {
                store.write_tag_once(Tag::Started)?;
            }

            // A node that has forgotten the job is done with it, whatever
            // the status string says.
            let mut remote_finished = matches!(
                check.status,
                RemoteStatus::Failed | RemoteStatus::Missing | RemoteStatus::Unknown
            ) || check.err_info.contains("does not exist");
            let mut success = false;

            if check.status == RemoteStatus::Finished {
                remote_finished = true;
                match self
                    .fetch_and_install(&store, &task, &check.result_url, client.as_ref(), key_params.as_ref())
                    .await?
                {
                    FetchOutcome::Installed { runtime } => {
                        success = true;
                        let dest = store.seq_dir(task.index);
                        let fields = self.flavor.finish_fields(
                            &dest,
                            task.index,
                            task.sequence.len(),
                            &task.annotation,
                            "newrun",
                            runtime,
                        );
                        finished_records.push(fields.join("\t"));
                        finished_idx.push(task.index);
                    }
                    FetchOutcome::FetchFailed => {
                        keep.push(task);
                        continue;
                    }
                    FetchOutcome::Incomplete => {}
                }
            }

            if remote_finished {
                if !success {
                    let count = retry.entry(task.index).or_insert(0);
                    *count += 1;
                    if *count >= self.cfg.max_resubmit {
                        tracing::warn!(
                            job_id = store.job_id(),
                            index = task.index,
                            failures = *count,
                            "Sequence failed permanently"
                        );
                        failed_idx.push(task.index);
                    } else {
                        tracing::info!(
                            job_id = store.job_id(),
                            index = task.index,
                            failures = *count,
                            "Scheduling resubmission"
                        );
                        resubmit_idx.push(task.index);
                    }
                }
                continue;
            }

            // Still pending remotely. Entries stuck in the queue without
            // ever running are orphans from node restarts; reclaim them.
            let age = now - task.submitted_epoch;
            if check.status != RemoteStatus::Running && age > self.cfg.max_remote_queue_secs as f64
            {
                tracing::info!(
                    job_id = store.job_id(),
                    remote_id = %task.remote_id,
                    age_secs = age as u64,
                    "Reclaiming stale remote task"
                );
                if let Err(e) = client.delete_job(&task.remote_id).await {
                    tracing::debug!(remote_id = %task.remote_id, error = %e, "Remote delete failed");
                }
                // Dropped: the repair path reschedules it once the queue
                // drains.
            } else {
                keep.push(task);
            }
        }

        finished_idx.sort_unstable();
        finished_idx.dedup();
        failed_idx.sort_unstable();
        failed_idx.dedup();
        resubmit_idx.sort_unstable();
        resubmit_idx.dedup();

        store.append_finished_records(&finished_records)?;
        store.append_set(SetKind::Finished, &finished_idx)?;
        store.append_set(SetKind::Failed, &failed_idx)?;
        store.append_set(SetKind::ToRun, &resubmit_idx)?;
        store.rewrite_remote_queue(&keep)?;
        store.write_retry_counts(&retry)?;
        Ok(())
    }

    /// Empty remote queue with unaccounted sequences: the queue file was
    /// lost or corrupted. Regenerate the to-run list as the complement of
    /// finished ∪ failed, charging one retry to every sequence that was
    /// not already scheduled.
    fn repair_lost_tasks(&self, store: &TaskStore) -> Result<()> {
        let finished = store.read_set(SetKind::Finished);
        let failed = store.read_set(SetKind::Failed);
        let info = store.job_info()?;
        let done: BTreeSet<usize> = finished.union(&failed).copied().collect();

        if done.len() >= info.numseq {
            store.rewrite_set(SetKind::ToRun, std::iter::empty())?;
            return Ok(());
        }

        let scheduled: BTreeSet<usize> = store.read_order().into_iter().collect();
        let missing: Vec<usize> = (0..info.numseq).filter(|i| !done.contains(i)).collect();
        let lost: Vec<usize> = missing
            .iter()
            .copied()
            .filter(|i| !scheduled.contains(i))
            .collect();
        let mut retry = store.read_retry_counts();
        for index in &lost {
            *retry.entry(*index).or_insert(0) += 1;
        }
        tracing::info!(
            job_id = store.job_id(),
            lost = lost.len(),
            pending = missing.len(),
            "Regenerated to-run list for unaccounted sequences"
        );
        store.rewrite_set(SetKind::ToRun, missing.iter().copied())?;
        store.write_retry_counts(&retry)?;
        Ok(())
    }

    async fn fetch_and_install(
        &self,
        store: &TaskStore,
        task: &RemoteTask,
        url: &str,
        client: &dyn NodeClient,
        key_params: Option<&Value>,
    ) -> Result<FetchOutcome> {
        if url.is_empty() {
            return Ok(FetchOutcome::FetchFailed);
        }
        let tmp = store.tmp_dir();
        let archive = tmp.join(format!("{}.tar.gz", task.remote_id));
        if let Err(e) = client.fetch_result(url, &archive).await {
            tracing::warn!(
                job_id = store.job_id(),
                remote_id = %task.remote_id,
                error = %e,
                "Result download failed, will retry"
            );
            return Ok(FetchOutcome::FetchFailed);
        }
        if let Err(e) = unpack_tar_gz(&archive, &tmp) {
            tracing::warn!(
                job_id = store.job_id(),
                remote_id = %task.remote_id,
                error = %e,
                "Result archive unextractable, will retry"
            );
            let _ = std::fs::remove_file(&archive);
            return Ok(FetchOutcome::FetchFailed);
        }

        let fetched = tmp.join(&task.remote_id);
        let result_root = self.flavor.fetched_result_root(&fetched);
        let dest = store.seq_dir(task.index);
        if !result_root.exists() {
            tracing::warn!(
                job_id = store.job_id(),
                remote_id = %task.remote_id,
                "Fetched archive has no result payload"
            );
            cleanup_fetch(&archive, &fetched);
            return Ok(FetchOutcome::Incomplete);
        }

        if dest.exists() {
            let _ = std::fs::remove_dir_all(&dest);
        }
        std::fs::rename(&result_root, &dest).map_err(|e| QdError::io(&dest, e))?;
        for stray in self.flavor.stray_result_files(&fetched) {
            if let Some(name) = stray.file_name() {
                if stray.exists() {
                    let _ = std::fs::rename(&stray, dest.join(name));
                }
            }
        }
        cleanup_fetch(&archive, &fetched);

        if !self.flavor.is_complete(&dest) {
            tracing::warn!(
                job_id = store.job_id(),
                index = task.index,
                "Fetched result failed the completeness check"
            );
            // Drop the bad copy, otherwise the resubmission would be
            // skipped as already handled.
            let _ = std::fs::remove_dir_all(&dest);
            return Ok(FetchOutcome::Incomplete);
        }

        // The remote side normalizes annotations; restore the original.
        let seq_fa = dest.join("seq.fa");
        std::fs::write(
            &seq_fa,
            fasta::format_record(&task.annotation, &task.sequence),
        )
        .map_err(|e| QdError::io(&seq_fa, e))?;

        let runtime = read_runtime(&dest.join("time.txt"), epoch_now() - task.submitted_epoch);

        if let Err(e) = client.delete_job(&task.remote_id).await {
            tracing::debug!(remote_id = %task.remote_id, error = %e, "Best-effort remote delete failed");
        }

        let key = CacheStore::key(&task.sequence, key_params);
        if let Err(e) = self.cache.archive(&dest, &key) {
            tracing::warn!(key = %key, error = %e, "Failed to archive result into cache");
        } else {
            self.cache.record_finish_date(&key, task.sequence.len());
        }

        tracing::info!(
            job_id = store.job_id(),
            index = task.index,
            runtime_secs = runtime as u64,
            "Result collected"
        );
        Ok(FetchOutcome::Installed { runtime })
    }

    /// Write the job-level finish tags once every sequence is accounted
    /// for. Idempotent; safe to call every pass.
    pub fn finalize_job(&self, job_id: &str) -> Result<()> {
        let store = TaskStore::open(self.cfg.job_dir(job_id));
        let info = store.job_info()?;
        let finished = store.read_set(SetKind::Finished);
        let failed = store.read_set(SetKind::Failed);
        if info.numseq > 0 && finished.len() + failed.len() >= info.numseq {
            if store.write_tag_once(Tag::Finished)? {
                tracing::info!(
                    job_id,
                    finished = finished.len(),
                    failed = failed.len(),
                    "Job complete"
                );
            }
            if failed.len() >= info.numseq {
                store.write_tag_once(Tag::Failed)?;
            }
        }
        Ok(())
    }

    fn key_params(&self, store: &TaskStore) -> Option<Value> {
        if !self.flavor.params_affect_output() {
            return None;
        }
        let text = std::fs::read_to_string(store.params_file()).unwrap_or_default();
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) if !map.is_empty() => Some(Value::Object(map)),
            _ => None,
        }
    }
}

fn cleanup_fetch(archive: &Path, fetched: &Path) {
    let _ = std::fs::remove_file(archive);
    let _ = std::fs::remove_dir_all(fetched);
}

/// Runtime as reported by the node in `time.txt` (`label;seconds`),
/// falling back to the caller-supplied wall time.
pub(crate) fn read_runtime(path: &Path, default: f64) -> f64 {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return default,
    };
    text.trim()
        .split(';')
        .nth(1)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_parses_label_seconds_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time.txt");
        std::fs::write(&path, "docker_topcons2;42.5\n").unwrap();
        assert_eq!(read_runtime(&path, 7.0), 42.5);
    }

    #[test]
    fn runtime_falls_back_on_missing_or_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_runtime(&dir.path().join("absent"), 7.0), 7.0);
        let path = dir.path().join("time.txt");
        std::fs::write(&path, "no separator here").unwrap();
        assert_eq!(read_runtime(&path, 7.0), 7.0);
    }
}
