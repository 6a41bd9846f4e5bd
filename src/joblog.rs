//! The queue-scheduler pass: replay the submission log, probe every open
//! job's on-disk state, and write the global priority-ordered run log that
//! drives the dispatcher and collector.
//!
//! Priority is fair-share: users with many outstanding sequences sink,
//! and within one user's jobs the smaller ones float. Blacklisted IPs are
//! scaled down a thousandfold; VIP users pin to a sentinel maximum.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::config::QdConfig;
use crate::error::{QdError, Result};
use crate::fasta;
use crate::flavor::{flavor_for, ServerFlavor};
use crate::lock::JobLock;
use crate::store::{JobInfo, SetKind, SubmitMethod, Tag, TaskStore};

const SUBMITTED_LOG: &str = "submitted_seq.log";
const RUNJOB_LOG: &str = "runjob_log.log";
const FINISHED_LOG: &str = "finished_job.log";
const ALL_SUBMITTED_LOG: &str = "all_submitted_seq.log";
const ALL_FINISHED_LOG: &str = "all_finished_job.log";

/// Sentinel priority for VIP submitters; sorts above anything the fair-
/// share formula can produce.
pub const VIP_PRIORITY: f64 = 999_999_999.0;

/// Job lifecycle state as derived from TaskStore contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Wait,
    Running,
    Finished,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Wait => write!(f, "Wait"),
            JobState::Running => write!(f, "Running"),
            JobState::Finished => write!(f, "Finished"),
            JobState::Failed => write!(f, "Failed"),
        }
    }
}

/// Derive a job's state from its tags: the failed tag dominates, then the
/// finish tag; a started job still holding its full to-run list has not
/// actually left the queue.
pub fn job_status(store: &TaskStore, numseq: usize) -> JobState {
    if store.has_tag(Tag::Failed) {
        JobState::Failed
    } else if store.has_tag(Tag::Finished) {
        JobState::Finished
    } else if store.has_tag(Tag::Started) && store.read_order().len() < numseq {
        JobState::Running
    } else {
        JobState::Wait
    }
}

/// One row of the run log.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub job_name: String,
    pub ip: String,
    pub email: String,
    pub numseq: usize,
    pub method: SubmitMethod,
    pub submit_date: String,
    pub start_date: String,
    pub finish_date: String,
    pub user_total: u32,
    pub priority: f64,
}

impl JobRecord {
    fn from_info(info: &JobInfo, state: JobState, start_date: String, finish_date: String) -> Self {
        Self {
            job_id: info.job_id.clone(),
            state,
            job_name: info.job_name.clone(),
            ip: info.ip.clone(),
            email: info.email.clone(),
            numseq: info.numseq,
            method: info.method,
            submit_date: info.submit_date.clone(),
            start_date,
            finish_date,
            user_total: 0,
            priority: 0.0,
        }
    }

    fn status_fields(&self) -> Vec<String> {
        vec![
            self.job_id.clone(),
            self.state.to_string(),
            self.job_name.clone(),
            self.ip.clone(),
            self.email.clone(),
            self.numseq.to_string(),
            self.method.to_string(),
            self.submit_date.clone(),
            self.start_date.clone(),
            self.finish_date.clone(),
        ]
    }

    fn to_finished_line(&self) -> String {
        self.status_fields().join("\t")
    }

    fn to_run_line(&self) -> String {
        let mut fields = self.status_fields();
        fields.push(self.user_total.to_string());
        fields.push(self.priority.to_string());
        fields.join("\t")
    }
}

fn suq_priority(user_total: u32) -> f64 {
    1.0e7 / user_total.max(1) as f64
}

/// Fair-share score: heavier users sink, and among one user's jobs the
/// smaller ones float.
pub fn fair_share_priority(user_total: u32, numseq: usize) -> f64 {
    let n = numseq.max(1) as f64;
    (suq_priority(user_total) - n) / n.sqrt()
}

/// Total outstanding sequences per job over all open jobs sharing the
/// job's IP or email. Jobs with neither count only themselves.
fn user_totals(records: &[JobRecord]) -> HashMap<String, u32> {
    let mut totals = HashMap::new();
    for a in records {
        let mut total = a.numseq as u32;
        if !(a.ip.is_empty() && a.email.is_empty()) {
            for b in records {
                if std::ptr::eq(a, b) {
                    continue;
                }
                let same_ip = !a.ip.is_empty() && a.ip == b.ip;
                let same_email = !a.email.is_empty() && a.email == b.email;
                if same_ip || same_email {
                    total = total.saturating_add(b.numseq as u32);
                }
            }
        }
        totals.insert(a.job_id.clone(), total);
    }
    totals
}

pub struct QueueScheduler<'a> {
    cfg: &'a QdConfig,
    flavor: &'static dyn ServerFlavor,
}

impl<'a> QueueScheduler<'a> {
    pub fn new(cfg: &'a QdConfig) -> Self {
        Self {
            cfg,
            flavor: flavor_for(cfg.server),
        }
    }

    /// Rebuild the global view of open jobs and write the priority-ordered
    /// run log. Returns the open jobs, waiting first, each list sorted by
    /// descending priority.
    pub fn create_run_joblog(&self, pass_index: u64) -> Result<Vec<JobRecord>> {
        let log_root = &self.cfg.log_root;
        std::fs::create_dir_all(log_root).map_err(|e| QdError::io(log_root, e))?;

        let submitted_text =
            std::fs::read_to_string(log_root.join(SUBMITTED_LOG)).unwrap_or_default();
        let finished_map = read_finished_log(&log_root.join(FINISHED_LOG));

        let mut new_submitted: Vec<(String, String)> = Vec::new();
        let mut new_finished: Vec<String> = Vec::new();
        let mut waiting: Vec<JobRecord> = Vec::new();
        let mut running: Vec<JobRecord> = Vec::new();

        for line in submitted_text.lines().filter(|l| !l.trim().is_empty()) {
            let info = match JobInfo::parse_line(line) {
                Some(info) => info,
                None => continue,
            };
            let job_dir = self.cfg.job_dir(&info.job_id);
            if !job_dir.exists() {
                // Retention deleted the directory; drop the entry.
                continue;
            }
            new_submitted.push((info.job_id.clone(), line.to_string()));

            if let Some(prev) = finished_map.get(&info.job_id) {
                new_finished.push(prev.clone());
                continue;
            }

            let store = TaskStore::open(&job_dir);
            let state = job_status(&store, info.numseq);
            let record = JobRecord::from_info(
                &info,
                state,
                store.tag_value(Tag::Started).unwrap_or_default(),
                store.tag_value(Tag::Finished).unwrap_or_default(),
            );

            match state {
                JobState::Finished | JobState::Failed => {
                    new_finished.push(record.to_finished_line())
                }
                JobState::Wait | JobState::Running => {
                    let queue_secs = queue_age_secs(&info.submit_date, self.cfg.upper_wait_secs);
                    if self.flavor.front_end_handles(
                        info.numseq,
                        info.method,
                        queue_secs,
                        self.cfg.upper_wait_secs,
                    ) {
                        continue;
                    }
                    if pass_index == 0 {
                        self.repair_finished_index(&store);
                    }
                    if state == JobState::Wait {
                        waiting.push(record);
                    } else {
                        running.push(record);
                    }
                }
            }
        }

        self.rewrite_logs(&new_submitted, &new_finished)?;

        // Fair-share totals span every open job, waiting or running.
        let mut open = waiting;
        open.append(&mut running);
        let totals = user_totals(&open);
        for record in &mut open {
            record.user_total = totals.get(&record.job_id).copied().unwrap_or(1);
            record.priority = fair_share_priority(record.user_total, record.numseq);
            if self.cfg.is_blacklisted(&record.ip) {
                record.priority /= 1000.0;
            }
            if self.cfg.is_vip(&record.email, &record.ip) {
                tracing::info!(job_id = %record.job_id, "VIP submitter, pinning priority");
                record.user_total = 1;
                record.priority = VIP_PRIORITY;
            }
        }
        let (mut waiting, mut running): (Vec<_>, Vec<_>) =
            open.into_iter().partition(|r| r.state == JobState::Wait);
        // Stable sorts: equal priorities keep submission-log order.
        waiting.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        running.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        let mut lines = String::new();
        for record in waiting.iter().chain(running.iter()) {
            lines.push_str(&record.to_run_line());
            lines.push('\n');
        }
        rewrite_atomic(&log_root.join(RUNJOB_LOG), &lines)?;

        tracing::debug!(
            waiting = waiting.len(),
            running = running.len(),
            finished = new_finished.len(),
            "Run log rebuilt"
        );
        waiting.extend(running);
        Ok(waiting)
    }

    fn rewrite_logs(&self, submitted: &[(String, String)], finished: &[String]) -> Result<()> {
        let log_root = &self.cfg.log_root;

        let mut text = String::new();
        for (_, line) in submitted {
            text.push_str(line);
            text.push('\n');
        }
        rewrite_atomic(&log_root.join(SUBMITTED_LOG), &text)?;

        let mut text = String::new();
        for line in finished {
            text.push_str(line);
            text.push('\n');
        }
        rewrite_atomic(&log_root.join(FINISHED_LOG), &text)?;

        // Per-IP views of the finished log for the statistics collaborator.
        let divided = log_root.join("divided");
        let mut by_ip: HashMap<&str, String> = HashMap::new();
        for line in finished {
            let ip = line.split('\t').nth(3).unwrap_or_default();
            if ip.is_empty() {
                continue;
            }
            let entry = by_ip.entry(ip).or_default();
            entry.push_str(line);
            entry.push('\n');
        }
        if !by_ip.is_empty() {
            std::fs::create_dir_all(&divided).map_err(|e| QdError::io(&divided, e))?;
        }
        for (ip, text) in by_ip {
            rewrite_atomic(&divided.join(format!("{}_finished_job.log", ip)), &text)?;
        }

        // Historical logs are append-only, deduplicated by job id.
        append_unseen(
            &log_root.join(ALL_FINISHED_LOG),
            finished.iter().map(|l| {
                let id = l.split('\t').next().unwrap_or_default().to_string();
                (id, l.clone())
            }),
            0,
        )?;
        append_unseen(
            &log_root.join(ALL_SUBMITTED_LOG),
            submitted.iter().cloned(),
            1,
        )?;
        Ok(())
    }

    /// Crash repair, first pass after startup only: fold result
    /// directories that exist and verify, but are missing from the
    /// finished index, back into it.
    fn repair_finished_index(&self, store: &TaskStore) {
        let out_dir = store.output_dir();
        if !out_dir.is_dir() {
            return;
        }
        // Skip jobs another worker is actively mutating.
        let _lock = match JobLock::acquire(store.root(), "runjob.lock") {
            Ok(lock) => lock,
            Err(_) => return,
        };
        let records = match fasta::read(&store.query_file()) {
            Ok(r) => r,
            Err(_) => return,
        };

        let known = store.finished_record_names();
        let mut found: Vec<usize> = Vec::new();
        let mut new_records: Vec<String> = Vec::new();
        let entries = match std::fs::read_dir(&out_dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let index: usize = match name.strip_prefix("seq_").and_then(|s| s.parse().ok()) {
                Some(i) => i,
                None => continue,
            };
            let dir = entry.path();
            if !self.flavor.is_complete(&dir) {
                continue;
            }
            found.push(index);
            if !known.contains(&name) {
                let (annotation, seq_len) = records
                    .get(index)
                    .map(|r| (r.annotation.replace('\t', " "), r.sequence.len()))
                    .unwrap_or_else(|| (name.clone(), 0));
                let runtime = crate::collect::read_runtime(&dir.join("time.txt"), 0.0);
                let fields = self.flavor.finish_fields(
                    &dir,
                    index,
                    seq_len,
                    &annotation,
                    "newrun",
                    runtime,
                );
                new_records.push(fields.join("\t"));
            }
        }
        if found.is_empty() && new_records.is_empty() {
            return;
        }

        let mut finished = store.read_set(SetKind::Finished);
        let before = finished.len();
        finished.extend(found);
        if finished.len() > before || !new_records.is_empty() {
            tracing::info!(
                job_id = store.job_id(),
                recovered = finished.len() - before,
                "Recovered finished sequences from disk"
            );
            let _ = store.rewrite_set(SetKind::Finished, finished);
            let _ = store.append_finished_records(&new_records);
        }
    }
}

/// Seconds a job has been queued; an unparseable submit date counts as
/// over the limit so the job is never stranded with the front-end.
fn queue_age_secs(submit_date: &str, upper_wait_secs: u64) -> u64 {
    let parsed = NaiveDateTime::parse_from_str(submit_date, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive));
    match parsed {
        Some(submitted) => (Utc::now() - submitted).num_seconds().max(0) as u64,
        None => upper_wait_secs + 1,
    }
}

fn read_finished_log(path: &Path) -> HashMap<String, String> {
    let text = std::fs::read_to_string(path).unwrap_or_default();
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| {
            l.split('\t')
                .next()
                .map(|id| (id.to_string(), l.to_string()))
        })
        .collect()
}

fn rewrite_atomic(path: &Path, text: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, text).map_err(|e| QdError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| QdError::io(path, e))
}

/// Append entries whose job id has not been logged yet. `id_column` is
/// where the job id sits in the existing lines.
fn append_unseen<I>(path: &Path, entries: I, id_column: usize) -> Result<()>
where
    I: Iterator<Item = (String, String)>,
{
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let seen: std::collections::HashSet<&str> = existing
        .lines()
        .filter_map(|l| l.split('\t').nth(id_column))
        .collect();
    let mut text = String::new();
    for (id, line) in entries {
        if !seen.contains(id.as_str()) {
            text.push_str(&line);
            text.push('\n');
        }
    }
    if text.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| QdError::io(path, e))?;
    file.write_all(text.as_bytes())
        .map_err(|e| QdError::io(path, e))
}
