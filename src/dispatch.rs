//! The dispatcher pass: resolve cache hits, build the ordered work list,
//! and push sequence tasks to compute nodes under capacity.
//!
//! The pass is re-entrant. Expensive one-time setup (cache resolution and
//! work-list construction) is guarded by the initialization tag, and the
//! cache scan checkpoints every few hits so a killed or yielded pass
//! resumes where it left off instead of reprocessing.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::Value;

use crate::config::QdConfig;
use crate::error::{QdError, Result};
use crate::fasta::{self, FastaRecord};
use crate::flavor::{flavor_for, ServerFlavor, WorkItem};
use crate::nodes::NodePool;
use crate::rpc::{NodeConnector, SubmitRequest};
use crate::store::{CacheStore, RemoteTask, SetKind, Tag, TaskStore};

pub struct Dispatcher<'a> {
    cfg: &'a QdConfig,
    cache: &'a CacheStore,
    connector: &'a dyn NodeConnector,
    flavor: &'static dyn ServerFlavor,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cfg: &'a QdConfig, cache: &'a CacheStore, connector: &'a dyn NodeConnector) -> Self {
        Self {
            cfg,
            cache,
            connector,
            flavor: flavor_for(cfg.server),
        }
    }

    /// Run one dispatcher pass for one job. `user_seq_count` is the fair-
    /// share total computed by the queue scheduler, forwarded to nodes.
    pub async fn submit_job(
        &self,
        job_id: &str,
        pool: &mut NodePool,
        user_seq_count: u32,
    ) -> Result<()> {
        let store = TaskStore::open(self.cfg.job_dir(job_id));
        let out_dir = store.output_dir();
        std::fs::create_dir_all(&out_dir).map_err(|e| QdError::io(&out_dir, e))?;

        let records = fasta::read(&store.query_file())?;
        if records.is_empty() {
            store.write_tag_once(Tag::Failed)?;
            tracing::error!(job_id, "Zero sequences read from query file");
            return Err(QdError::EmptyQuery(job_id.to_string()));
        }

        let force_run = store.has_tag(Tag::ForceRun);
        if !store.has_tag(Tag::Initialized) {
            if !force_run && !store.has_tag(Tag::CacheDone) {
                if !self.cache_pass(&store, &records)? {
                    // Budget exhausted; the scan resumes next pass.
                    return Ok(());
                }
            }
            self.build_work_list(&store, &records)?;
        }

        self.submission_loop(&store, &records, pool, user_seq_count, force_run)
            .await
    }

    /// Scan sequences for cache hits, resuming from the last checkpoint.
    /// Returns false when the per-pass budget ran out before the scan
    /// covered the whole job.
    fn cache_pass(&self, store: &TaskStore, records: &[FastaRecord]) -> Result<bool> {
        let finished = store.read_set(SetKind::Finished);
        let key_params = self.key_params(store);
        let start = store.read_cache_checkpoint().map_or(0, |i| i + 1);
        let mut hits_processed = 0usize;

        for (i, record) in records.iter().enumerate().skip(start) {
            if finished.contains(&i) {
                continue;
            }
            let key = CacheStore::key(&record.sequence, key_params.as_ref());
            if self.cache.lookup(&key).is_none() {
                continue;
            }
            let dest = store.seq_dir(i);
            if self.cache.materialize(&key, &dest)? {
                if self.flavor.is_complete(&dest) {
                    self.accept_cached(store, &dest, i, record)?;
                } else {
                    // Partial entry: drop the copy so the sequence falls
                    // through to normal scheduling.
                    tracing::warn!(job_id = store.job_id(), index = i, key = %key, "Incomplete cache hit skipped");
                    let _ = std::fs::remove_dir_all(&dest);
                }
            }
            hits_processed += 1;
            if hits_processed >= self.cfg.max_cache_per_pass && i + 1 < records.len() {
                store.write_cache_checkpoint(i)?;
                tracing::info!(
                    job_id = store.job_id(),
                    checkpoint = i,
                    "Cache scan budget exhausted, yielding"
                );
                return Ok(false);
            }
        }

        store.write_tag_once(Tag::CacheDone)?;
        Ok(true)
    }

    fn accept_cached(
        &self,
        store: &TaskStore,
        dest: &Path,
        index: usize,
        record: &FastaRecord,
    ) -> Result<()> {
        // The cached copy carries whatever annotation it was computed
        // under; restore this job's.
        let seq_fa = dest.join("seq.fa");
        std::fs::write(
            &seq_fa,
            fasta::format_record(&record.annotation, &record.sequence),
        )
        .map_err(|e| QdError::io(&seq_fa, e))?;
        store.write_tag_once(Tag::Started)?;
        let fields = self.flavor.finish_fields(
            dest,
            index,
            record.sequence.len(),
            &record.annotation,
            "cached",
            0.0,
        );
        store.append_finished_records(&[fields.join("\t")])?;
        store.append_set(SetKind::Finished, &[index])?;
        tracing::debug!(job_id = store.job_id(), index, "Served from cache");
        Ok(())
    }

    /// Build the ordered to-run list and the per-sequence split files.
    /// Runs exactly once per job; the initialization tag is written last
    /// so a crash mid-construction repeats the whole step.
    fn build_work_list(&self, store: &TaskStore, records: &[FastaRecord]) -> Result<()> {
        let finished = store.read_set(SetKind::Finished);
        let failed = store.read_set(SetKind::Failed);
        let mut items: Vec<WorkItem> = records
            .iter()
            .enumerate()
            .filter(|(i, _)| !finished.contains(i) && !failed.contains(i))
            .map(|(i, r)| WorkItem {
                index: i,
                annotation: r.annotation.replace('\t', " "),
                sequence: r.sequence.clone(),
                weight: 0.0,
            })
            .collect();
        self.flavor.order_work_list(&mut items);

        store.rewrite_set(SetKind::ToRun, items.iter().map(|it| it.index))?;
        store.write_retry_counts(&items.iter().map(|it| (it.index, 0)).collect())?;

        let split = store.split_dir();
        std::fs::create_dir_all(&split).map_err(|e| QdError::io(&split, e))?;
        for item in &items {
            let path = split.join(format!("query_{}.fa", item.index));
            std::fs::write(&path, fasta::format_record(&item.annotation, &item.sequence))
                .map_err(|e| QdError::io(&path, e))?;
        }

        store.write_tag_once(Tag::Initialized)?;
        tracing::info!(job_id = store.job_id(), pending = items.len(), "Work list initialized");
        Ok(())
    }

    async fn submission_loop(
        &self,
        store: &TaskStore,
        records: &[FastaRecord],
        pool: &mut NodePool,
        user_seq_count: u32,
        force_run: bool,
    ) -> Result<()> {
        let to_run = store.read_order();
        if to_run.is_empty() {
            return Ok(());
        }

        let params_base = self.load_params(store);
        // Only privileged submitters forward their address to the nodes.
        let email = store
            .job_info()
            .map(|i| i.email)
            .ok()
            .filter(|e| self.cfg.vip_users.iter().any(|v| v == e))
            .unwrap_or_default();

        let mut submitted: Vec<RemoteTask> = Vec::new();
        let mut resolved: HashSet<usize> = HashSet::new();
        let mut tries: HashMap<usize, u32> = HashMap::new();
        let mut cursor = 0usize;

        for slot in pool.slots_mut().iter_mut() {
            if cursor >= to_run.len() {
                break;
            }
            if !slot.has_capacity() {
                continue;
            }
            let client = match self.connector.connect(&slot.addr).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(node = %slot.addr, error = %e, "Node unreachable, offline for this pass");
                    slot.set_offline();
                    continue;
                }
            };

            while slot.has_capacity() && cursor < to_run.len() {
                let index = to_run[cursor];

                // An output directory left by an earlier pass means the
                // sequence was already handled; never submit it twice.
                if store.seq_dir(index).exists() {
                    resolved.insert(index);
                    cursor += 1;
                    continue;
                }

                let (annotation, sequence, fasta_text, seq_id) =
                    self.task_input(store, records, index);
                if sequence.is_empty() {
                    tracing::warn!(job_id = store.job_id(), index, "Empty sequence dropped from work list");
                    resolved.insert(index);
                    cursor += 1;
                    continue;
                }

                let mut params = params_base.clone();
                params.insert(
                    "name_software".into(),
                    Value::String(self.flavor.software_name(slot.queue)),
                );
                params.insert("queue_method".into(), Value::String(slot.queue.to_string()));
                self.flavor.inject_params(&mut params, store.root(), &seq_id);

                let attempts = {
                    let n = tries.entry(index).or_insert(0);
                    *n += 1;
                    *n
                };
                let outcome = client
                    .submit_sequence(SubmitRequest {
                        fasta: fasta_text,
                        params_json: Value::Object(params).to_string(),
                        job_name: String::new(),
                        email: email.clone(),
                        user_seq_count,
                        force_run,
                    })
                    .await;

                match outcome {
                    Ok(reply) if reply.accepted() => {
                        tracing::info!(
                            job_id = store.job_id(),
                            index,
                            node = %slot.addr,
                            remote_id = %reply.remote_job_id,
                            "Sequence submitted"
                        );
                        submitted.push(RemoteTask {
                            index,
                            node: slot.addr.clone(),
                            remote_id: reply.remote_job_id,
                            annotation,
                            sequence,
                            submitted_epoch: epoch_now(),
                        });
                        slot.accept();
                        resolved.insert(index);
                        cursor += 1;
                    }
                    Ok(reply) => {
                        tracing::warn!(
                            job_id = store.job_id(),
                            index,
                            node = %slot.addr,
                            err_info = %reply.err_info,
                            "Submission rejected"
                        );
                        if attempts >= self.cfg.max_submit_try {
                            tracing::warn!(job_id = store.job_id(), index, "Failed to submit, giving up");
                            resolved.insert(index);
                            cursor += 1;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            job_id = store.job_id(),
                            index,
                            node = %slot.addr,
                            error = %e,
                            "Submission RPC failed"
                        );
                        if attempts >= self.cfg.max_submit_try {
                            tracing::warn!(job_id = store.job_id(), index, "Failed to submit, giving up");
                            resolved.insert(index);
                            cursor += 1;
                        }
                    }
                }
            }
        }

        store.append_remote_queue(&submitted)?;
        store.rewrite_set(
            SetKind::ToRun,
            to_run.iter().copied().filter(|i| !resolved.contains(i)),
        )?;
        Ok(())
    }

    /// FASTA input for one task: the split file written at initialization,
    /// falling back to the full query file.
    fn task_input(
        &self,
        store: &TaskStore,
        records: &[FastaRecord],
        index: usize,
    ) -> (String, String, String, String) {
        let split_file = store.split_dir().join(format!("query_{}.fa", index));
        if let Ok(text) = std::fs::read_to_string(&split_file) {
            if let Some(rec) = fasta::parse(&text).into_iter().next() {
                return (rec.annotation.clone(), rec.sequence.clone(), text, rec.id);
            }
        }
        match records.get(index) {
            Some(r) => (
                r.annotation.replace('\t', " "),
                r.sequence.clone(),
                fasta::format_record(&r.annotation, &r.sequence),
                r.id.clone(),
            ),
            None => Default::default(),
        }
    }

    fn load_params(&self, store: &TaskStore) -> serde_json::Map<String, Value> {
        let text = std::fs::read_to_string(store.params_file()).unwrap_or_default();
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    fn key_params(&self, store: &TaskStore) -> Option<Value> {
        if !self.flavor.params_affect_output() {
            return None;
        }
        let map = self.load_params(store);
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }
}

pub(crate) fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
