//! Flat-file state store for one job.
//!
//! Everything the dispatcher, collector and scheduler know about a job
//! lives in plain line-oriented files inside the job directory, so state
//! survives crashes, stays greppable, and can be repaired by hand. Reads
//! treat missing or corrupt files as empty; rewrites go through a
//! write-temp-then-rename so a killed pass never leaves a torn index.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{QdError, Result};

const FINISHED_IDX: &str = "finished_seqindex.txt";
const FAILED_IDX: &str = "failed_seqindex.txt";
const TORUN_IDX: &str = "torun_seqindex.txt";
const REMOTE_QUEUE: &str = "remotequeue_seqindex.txt";
const RETRY_COUNTS: &str = "submit_try.json";
const CACHE_CHECKPOINT: &str = "cache_checkpoint.txt";
const JOB_INFO: &str = "jobinfo";
const FINISHED_RECORDS: &str = "finished_seqs.txt";

/// The three index sets a job maintains. `ToRun` is the only ordered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Finished,
    Failed,
    ToRun,
}

impl SetKind {
    fn filename(self) -> &'static str {
        match self {
            SetKind::Finished => FINISHED_IDX,
            SetKind::Failed => FAILED_IDX,
            SetKind::ToRun => TORUN_IDX,
        }
    }
}

/// Boolean markers with first-writer-wins semantics. The stored value is
/// the datetime of the first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Work-list construction has completed; never initialize twice.
    Initialized,
    /// The full cache-resolution scan has completed.
    CacheDone,
    /// First sequence left the Wait state.
    Started,
    /// All sequences are accounted for.
    Finished,
    /// The job failed as a whole.
    Failed,
    /// Written by the front-end to bypass the cache pass.
    ForceRun,
}

impl Tag {
    fn filename(self) -> &'static str {
        match self {
            Tag::Initialized => "runjob.qdinit",
            Tag::CacheDone => "cache_processed.finish",
            Tag::Started => "runjob.start",
            Tag::Finished => "runjob.finish",
            Tag::Failed => "runjob.failed",
            Tag::ForceRun => "forcerun",
        }
    }
}

/// One in-flight remote task: a single line of the remote-queue file.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub index: usize,
    pub node: String,
    pub remote_id: String,
    pub annotation: String,
    pub sequence: String,
    pub submitted_epoch: f64,
}

impl RemoteTask {
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.index,
            self.node,
            self.remote_id,
            self.annotation.replace('\t', " "),
            self.sequence,
            self.submitted_epoch
        )
    }

    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return None;
        }
        Some(Self {
            index: fields[0].trim().parse().ok()?,
            node: fields[1].to_string(),
            remote_id: fields[2].to_string(),
            annotation: fields[3].to_string(),
            sequence: fields[4].to_string(),
            submitted_epoch: fields[5].trim().parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMethod {
    Web,
    Api,
}

impl SubmitMethod {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("wsdl") {
            SubmitMethod::Api
        } else {
            SubmitMethod::Web
        }
    }
}

impl std::fmt::Display for SubmitMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitMethod::Web => write!(f, "web"),
            SubmitMethod::Api => write!(f, "wsdl"),
        }
    }
}

/// Submission metadata, written by the front-end as a single TAB-separated
/// line when the job directory is created.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub submit_date: String,
    pub job_id: String,
    pub ip: String,
    pub numseq: usize,
    pub raw_size: u64,
    pub job_name: String,
    pub email: String,
    pub method: SubmitMethod,
}

impl JobInfo {
    pub fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return None;
        }
        Some(Self {
            submit_date: fields[0].to_string(),
            job_id: fields[1].to_string(),
            ip: fields[2].to_string(),
            numseq: fields[3].trim().parse().unwrap_or(1),
            raw_size: fields[4].trim().parse().unwrap_or(0),
            job_name: fields[5].to_string(),
            email: fields[6].trim().to_string(),
            method: SubmitMethod::parse(fields[7].trim()),
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.submit_date,
            self.job_id,
            self.ip,
            self.numseq,
            self.raw_size,
            self.job_name,
            self.email,
            self.method
        )
    }
}

/// Handle over one job directory.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
    job_id: String,
}

impl TaskStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let job_id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { root, job_id }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Where per-sequence result directories are collected.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.job_id)
    }

    pub fn seq_dir(&self, index: usize) -> PathBuf {
        self.output_dir().join(format!("seq_{}", index))
    }

    pub fn query_file(&self) -> PathBuf {
        self.root.join("query.fa")
    }

    pub fn params_file(&self) -> PathBuf {
        self.root.join("query_params.json")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmpdir")
    }

    pub fn split_dir(&self) -> PathBuf {
        self.tmp_dir().join("split")
    }

    // ------------------------------------------------------------------
    // Index sets
    // ------------------------------------------------------------------

    /// Read an index set. Missing, empty or partially corrupt files all
    /// collapse to "whatever parsed", never an error.
    pub fn read_set(&self, kind: SetKind) -> BTreeSet<usize> {
        self.read_index_lines(kind.filename()).into_iter().collect()
    }

    /// Read the to-run list preserving order, duplicates removed keeping
    /// the first occurrence.
    pub fn read_order(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.read_index_lines(TORUN_IDX)
            .into_iter()
            .filter(|i| seen.insert(*i))
            .collect()
    }

    pub fn append_set(&self, kind: SetKind, entries: &[usize]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut text = String::new();
        for idx in entries {
            text.push_str(&idx.to_string());
            text.push('\n');
        }
        self.append(&self.root.join(kind.filename()), &text)
    }

    /// Atomically replace an index file.
    pub fn rewrite_set<I>(&self, kind: SetKind, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut text = String::new();
        for idx in entries {
            text.push_str(&idx.to_string());
            text.push('\n');
        }
        self.rewrite_atomic(&self.root.join(kind.filename()), &text)
    }

    fn read_index_lines(&self, filename: &str) -> Vec<usize> {
        self.read_lines(filename)
            .iter()
            .filter_map(|l| l.trim().parse::<usize>().ok())
            .collect()
    }

    // ------------------------------------------------------------------
    // Remote queue
    // ------------------------------------------------------------------

    pub fn read_remote_queue(&self) -> Vec<RemoteTask> {
        self.read_lines(REMOTE_QUEUE)
            .iter()
            .filter(|l| !l.starts_with('#'))
            .filter_map(|l| RemoteTask::parse(l))
            .collect()
    }

    pub fn append_remote_queue(&self, tasks: &[RemoteTask]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut text = String::new();
        for task in tasks {
            text.push_str(&task.to_line());
            text.push('\n');
        }
        self.append(&self.root.join(REMOTE_QUEUE), &text)
    }

    pub fn rewrite_remote_queue(&self, tasks: &[RemoteTask]) -> Result<()> {
        let mut text = String::new();
        for task in tasks {
            text.push_str(&task.to_line());
            text.push('\n');
        }
        self.rewrite_atomic(&self.root.join(REMOTE_QUEUE), &text)
    }

    // ------------------------------------------------------------------
    // Retry counters
    // ------------------------------------------------------------------

    /// A corrupt counter file resets every count to zero rather than
    /// failing the pass.
    pub fn read_retry_counts(&self) -> HashMap<usize, u32> {
        let path = self.root.join(RETRY_COUNTS);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) => return HashMap::new(),
        };
        let raw: HashMap<String, u32> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt retry-count map, resetting");
                return HashMap::new();
            }
        };
        raw.into_iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|k| (k, v)))
            .collect()
    }

    pub fn write_retry_counts(&self, counts: &HashMap<usize, u32>) -> Result<()> {
        let raw: HashMap<String, u32> = counts.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        self.rewrite_atomic(&self.root.join(RETRY_COUNTS), &serde_json::to_string(&raw)?)
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.root.join(tag.filename()).exists()
    }

    /// Write a tag with the current datetime. First writer wins; returns
    /// whether this call created it.
    pub fn write_tag_once(&self, tag: Tag) -> Result<bool> {
        let path = self.root.join(tag.filename());
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
                file.write_all(stamp.as_bytes())
                    .map_err(|e| QdError::io(&path, e))?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(QdError::io(&path, e)),
        }
    }

    pub fn tag_value(&self, tag: Tag) -> Option<String> {
        std::fs::read_to_string(self.root.join(tag.filename()))
            .ok()
            .map(|s| s.trim().to_string())
    }

    // ------------------------------------------------------------------
    // Job metadata and finished records
    // ------------------------------------------------------------------

    pub fn job_info(&self) -> Result<JobInfo> {
        let path = self.root.join(JOB_INFO);
        let text = std::fs::read_to_string(&path).map_err(|e| QdError::io(&path, e))?;
        JobInfo::parse_line(text.trim())
            .ok_or_else(|| QdError::Corrupt(format!("unparseable jobinfo for {}", self.job_id)))
    }

    /// Append per-sequence summary lines to the job's finished-records
    /// file (one line per completed sequence, flavor-specific fields).
    pub fn append_finished_records(&self, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let dir = self.output_dir();
        std::fs::create_dir_all(&dir).map_err(|e| QdError::io(&dir, e))?;
        self.append(&dir.join(FINISHED_RECORDS), &(lines.join("\n") + "\n"))
    }

    /// First column (`seq_<idx>`) of every finished record, for repair.
    pub fn finished_record_names(&self) -> HashSet<String> {
        let path = self.output_dir().join(FINISHED_RECORDS);
        let text = std::fs::read_to_string(path).unwrap_or_default();
        text.lines()
            .filter_map(|l| l.split('\t').next())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    // ------------------------------------------------------------------
    // Cache-scan checkpoint
    // ------------------------------------------------------------------

    pub fn read_cache_checkpoint(&self) -> Option<usize> {
        std::fs::read_to_string(self.root.join(CACHE_CHECKPOINT))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_cache_checkpoint(&self, index: usize) -> Result<()> {
        self.rewrite_atomic(&self.root.join(CACHE_CHECKPOINT), &index.to_string())
    }

    // ------------------------------------------------------------------
    // File primitives
    // ------------------------------------------------------------------

    fn read_lines(&self, filename: &str) -> Vec<String> {
        let text = std::fs::read_to_string(self.root.join(filename)).unwrap_or_default();
        text.lines()
            .map(|l| l.to_string())
            .filter(|l| !l.trim().is_empty())
            .collect()
    }

    fn append(&self, path: &Path, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| QdError::io(path, e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| QdError::io(path, e))
    }

    /// Write to a sibling temp file, then rename over the target, so a
    /// pass killed mid-write never leaves a torn index behind.
    fn rewrite_atomic(&self, path: &Path, text: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text).map_err(|e| QdError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| QdError::io(path, e))
    }
}
