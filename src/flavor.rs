//! Per-server behavior differences, expressed as one capability trait with
//! an implementation per prediction server instead of string comparisons
//! scattered through the scheduling code.
//!
//! A flavor decides: what file proves a result directory is complete, where
//! the per-sequence result sits inside a fetched archive, which summary
//! fields go into the finished-records file, whether job parameters change
//! the output (and therefore the cache key), how the work list is
//! pre-ordered, and which extra parameters are injected at submit time.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::{QueueDiscipline, ServerKind};
use crate::store::SubmitMethod;

/// One entry of the work list under construction.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: usize,
    pub annotation: String,
    pub sequence: String,
    pub weight: f64,
}

pub trait ServerFlavor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether job parameters influence the prediction output. When true,
    /// cache keys mix in the canonical parameter encoding.
    fn params_affect_output(&self) -> bool {
        false
    }

    /// The file that must exist before a result directory is trusted,
    /// either from the cache or freshly fetched. None means the directory
    /// itself is proof enough.
    fn completeness_marker(&self, seq_dir: &Path) -> Option<PathBuf>;

    fn is_complete(&self, seq_dir: &Path) -> bool {
        match self.completeness_marker(seq_dir) {
            Some(marker) => marker.is_file(),
            None => seq_dir.is_dir(),
        }
    }

    /// Where the per-sequence result root sits inside a fetched archive
    /// (the remote side always computes a single-sequence job).
    fn fetched_result_root(&self, fetched: &Path) -> PathBuf {
        fetched.join("seq_0")
    }

    /// Files that the remote layout leaves outside the result root and
    /// that must be moved in next to it.
    fn stray_result_files(&self, _fetched: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Summary fields for one finished sequence, TAB-joined by the caller.
    fn finish_fields(
        &self,
        seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String>;

    /// Cheap local pre-filter that may reorder the work list before it is
    /// written. Default: keep input order.
    fn order_work_list(&self, _items: &mut Vec<WorkItem>) {}

    /// Flavor-specific parameters injected immediately before each
    /// submission (not during list construction).
    fn inject_params(&self, _params: &mut serde_json::Map<String, Value>, _job_dir: &Path, _seq_id: &str) {
    }

    /// Software identifier sent with a submission; depends on how the
    /// target node runs its queue.
    fn software_name(&self, queue: QueueDiscipline) -> String {
        match queue {
            QueueDiscipline::Suq => format!("docker_{}", self.name()),
            QueueDiscipline::Slurm => format!("singularity_{}", self.name()),
        }
    }

    /// Whether the web front-end serves this job inline, keeping it out of
    /// this daemon's queue. Only small, fresh, interactive jobs qualify.
    fn front_end_handles(
        &self,
        _numseq: usize,
        _method: SubmitMethod,
        _queue_secs: u64,
        _upper_wait_secs: u64,
    ) -> bool {
        false
    }
}

pub fn flavor_for(kind: ServerKind) -> &'static dyn ServerFlavor {
    match kind {
        ServerKind::Topcons2 => &Topcons2,
        ServerKind::Boctopus2 => &Boctopus2,
        ServerKind::Pconsc3 => &Pconsc3,
        ServerKind::Subcons => &Subcons,
        ServerKind::Prodres => &Prodres,
        ServerKind::Pathopred => &Pathopred,
    }
}

fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Common 8-field summary layout: name, length, two flavor stats, result
/// source, runtime, annotation, completion date.
fn base_fields(
    index: usize,
    seq_len: usize,
    stat1: String,
    stat2: String,
    source: &str,
    runtime: f64,
    annotation: &str,
) -> Vec<String> {
    vec![
        format!("seq_{}", index),
        seq_len.to_string(),
        stat1,
        stat2,
        source.to_string(),
        format!("{:.1}", runtime),
        annotation.replace('\t', " "),
        now_stamp(),
    ]
}

/// Number of maximal membrane (`M`) segments in a topology string.
fn count_tm_segments(topology: &str) -> usize {
    let mut count = 0;
    let mut in_segment = false;
    for c in topology.chars() {
        if c == 'M' {
            if !in_segment {
                count += 1;
            }
            in_segment = true;
        } else {
            in_segment = false;
        }
    }
    count
}

/// Crude local transmembrane screen: count non-overlapping 19-residue
/// windows dominated by hydrophobic residues. Used only to order work so
/// that likely-membrane sequences reach the nodes first; the real
/// prediction happens remotely.
fn estimate_tm_segments(sequence: &str) -> usize {
    const WINDOW: usize = 19;
    const MIN_HYDROPHOBIC: usize = 13;
    let residues: Vec<char> = sequence.chars().collect();
    if residues.len() < WINDOW {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + WINDOW <= residues.len() {
        let hydrophobic = residues[i..i + WINDOW]
            .iter()
            .filter(|c| "AILMFWVC".contains(**c))
            .count();
        if hydrophobic >= MIN_HYDROPHOBIC {
            count += 1;
            i += WINDOW;
        } else {
            i += 1;
        }
    }
    count
}

fn topology_fields(
    seq_dir: &Path,
    index: usize,
    seq_len: usize,
    annotation: &str,
    source: &str,
    runtime: f64,
) -> Vec<String> {
    let topology = std::fs::read_to_string(seq_dir.join("Topcons").join("topcons.top"))
        .unwrap_or_default();
    let topology = topology.trim();
    let num_tm = count_tm_segments(topology);
    let has_sp = topology.contains('S');
    base_fields(
        index,
        seq_len,
        num_tm.to_string(),
        has_sp.to_string(),
        source,
        runtime,
        annotation,
    )
}

// ---------------------------------------------------------------------
// Flavors
// ---------------------------------------------------------------------

pub struct Topcons2;

impl ServerFlavor for Topcons2 {
    fn name(&self) -> &'static str {
        "topcons2"
    }

    fn completeness_marker(&self, seq_dir: &Path) -> Option<PathBuf> {
        Some(seq_dir.join("Topcons").join("topcons.top"))
    }

    fn finish_fields(
        &self,
        seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String> {
        topology_fields(seq_dir, index, seq_len, annotation, source, runtime)
    }

    fn order_work_list(&self, items: &mut Vec<WorkItem>) {
        for item in items.iter_mut() {
            item.weight = estimate_tm_segments(&item.sequence) as f64;
        }
        // Stable: equal weights keep their original input order.
        items.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    }

    fn front_end_handles(
        &self,
        numseq: usize,
        method: SubmitMethod,
        queue_secs: u64,
        upper_wait_secs: u64,
    ) -> bool {
        numseq <= 1 && method == SubmitMethod::Web && queue_secs <= upper_wait_secs
    }
}

pub struct Boctopus2;

impl ServerFlavor for Boctopus2 {
    fn name(&self) -> &'static str {
        "boctopus2"
    }

    fn completeness_marker(&self, seq_dir: &Path) -> Option<PathBuf> {
        Some(seq_dir.join("query.predict.png"))
    }

    fn fetched_result_root(&self, fetched: &Path) -> PathBuf {
        fetched.join("seq_0").join("seq_0")
    }

    fn stray_result_files(&self, fetched: &Path) -> Vec<PathBuf> {
        vec![
            fetched.join("seq_0").join("seq.fa"),
            fetched.join("seq_0").join("time.txt"),
        ]
    }

    fn finish_fields(
        &self,
        seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String> {
        topology_fields(seq_dir, index, seq_len, annotation, source, runtime)
    }
}

pub struct Pconsc3;

impl ServerFlavor for Pconsc3 {
    fn name(&self) -> &'static str {
        "pconsc3"
    }

    fn completeness_marker(&self, seq_dir: &Path) -> Option<PathBuf> {
        Some(seq_dir.join("query.fa.hhE0.pconsc3.out"))
    }

    /// pconsc3 archives are rooted at the result itself, not a seq_0
    /// wrapper directory.
    fn fetched_result_root(&self, fetched: &Path) -> PathBuf {
        fetched.to_path_buf()
    }

    fn finish_fields(
        &self,
        _seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String> {
        base_fields(index, seq_len, "-".into(), "-".into(), source, runtime, annotation)
    }
}

pub struct Subcons;

impl ServerFlavor for Subcons {
    fn name(&self) -> &'static str {
        "subcons"
    }

    fn completeness_marker(&self, seq_dir: &Path) -> Option<PathBuf> {
        Some(seq_dir.join("plot").join("query_0.png"))
    }

    fn finish_fields(
        &self,
        seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String> {
        let (location, score) = read_subcons_prediction(seq_dir);
        base_fields(index, seq_len, location, score, source, runtime, annotation)
    }
}

/// Predicted location and confidence from the final-prediction CSV; "-"
/// placeholders when the file is missing or short.
fn read_subcons_prediction(seq_dir: &Path) -> (String, String) {
    let csv = seq_dir
        .join("final-prediction")
        .join("query_0.subcons-final-pred.csv");
    let text = std::fs::read_to_string(csv).unwrap_or_default();
    let data_line = text.lines().nth(1).unwrap_or_default();
    let fields: Vec<&str> = data_line.split(',').collect();
    let location = fields.get(1).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let score = fields.get(2).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    (
        location.unwrap_or_else(|| "-".into()),
        score.unwrap_or_else(|| "-".into()),
    )
}

pub struct Prodres;

impl ServerFlavor for Prodres {
    fn name(&self) -> &'static str {
        "prodres"
    }

    /// prodres output depends on the search parameters, so equal sequences
    /// with different parameters must not share cache entries.
    fn params_affect_output(&self) -> bool {
        true
    }

    fn completeness_marker(&self, _seq_dir: &Path) -> Option<PathBuf> {
        None
    }

    fn finish_fields(
        &self,
        _seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String> {
        base_fields(index, seq_len, "-".into(), "-".into(), source, runtime, annotation)
    }

    fn software_name(&self, _queue: QueueDiscipline) -> String {
        "prodres".to_string()
    }
}

pub struct Pathopred;

impl ServerFlavor for Pathopred {
    fn name(&self) -> &'static str {
        "pathopred"
    }

    fn completeness_marker(&self, seq_dir: &Path) -> Option<PathBuf> {
        Some(seq_dir.join("output_predictions"))
    }

    fn finish_fields(
        &self,
        _seq_dir: &Path,
        index: usize,
        seq_len: usize,
        annotation: &str,
        source: &str,
        runtime: f64,
    ) -> Vec<String> {
        base_fields(index, seq_len, "-".into(), "-".into(), source, runtime, annotation)
    }

    /// Variant data rides along with every submission, together with the
    /// identifier the variants refer to.
    fn inject_params(&self, params: &mut serde_json::Map<String, Value>, job_dir: &Path, seq_id: &str) {
        let variants = std::fs::read_to_string(job_dir.join("variants.fa")).unwrap_or_default();
        params.insert("variants".into(), Value::String(variants));
        params.insert("identifier_name".into(), Value::String(seq_id.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tm_segments() {
        assert_eq!(count_tm_segments(""), 0);
        assert_eq!(count_tm_segments("iiiooo"), 0);
        assert_eq!(count_tm_segments("iiMMMMoooMMMMii"), 2);
        assert_eq!(count_tm_segments("MMMM"), 1);
    }

    #[test]
    fn tm_estimate_orders_membrane_sequences_first() {
        let soluble = "MDEKRNSTQEDGKHPENSRDEQKT".repeat(3);
        let membrane = format!("MDE{}KRS{}", "AILMFWVCAILMFWVCAIL", "LLLLIIIIAAAAFFFFVVV");
        let mut items = vec![
            WorkItem {
                index: 0,
                annotation: "soluble".into(),
                sequence: soluble,
                weight: 0.0,
            },
            WorkItem {
                index: 1,
                annotation: "membrane".into(),
                sequence: membrane,
                weight: 0.0,
            },
        ];
        Topcons2.order_work_list(&mut items);
        assert_eq!(items[0].index, 1);
    }

    #[test]
    fn order_is_stable_for_equal_weights() {
        let mut items: Vec<WorkItem> = (0..4)
            .map(|i| WorkItem {
                index: i,
                annotation: format!("s{}", i),
                sequence: "MDEKRN".into(),
                weight: 0.0,
            })
            .collect();
        Topcons2.order_work_list(&mut items);
        let order: Vec<usize> = items.iter().map(|i| i.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn completeness_markers_gate_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        let seq_dir = dir.path().join("seq_0");
        std::fs::create_dir_all(&seq_dir).unwrap();

        assert!(!Topcons2.is_complete(&seq_dir));
        std::fs::create_dir_all(seq_dir.join("Topcons")).unwrap();
        std::fs::write(seq_dir.join("Topcons/topcons.top"), "MM").unwrap();
        assert!(Topcons2.is_complete(&seq_dir));

        // prodres has no marker: any existing directory passes.
        assert!(Prodres.is_complete(&seq_dir));
        assert!(!Prodres.is_complete(&dir.path().join("absent")));
    }

    #[test]
    fn software_name_follows_queue_discipline() {
        assert_eq!(Topcons2.software_name(QueueDiscipline::Suq), "docker_topcons2");
        assert_eq!(
            Topcons2.software_name(QueueDiscipline::Slurm),
            "singularity_topcons2"
        );
        assert_eq!(Prodres.software_name(QueueDiscipline::Slurm), "prodres");
    }

    #[test]
    fn front_end_keeps_only_small_fresh_web_jobs() {
        assert!(Topcons2.front_end_handles(1, SubmitMethod::Web, 10, 900));
        assert!(!Topcons2.front_end_handles(2, SubmitMethod::Web, 10, 900));
        assert!(!Topcons2.front_end_handles(1, SubmitMethod::Api, 10, 900));
        assert!(!Topcons2.front_end_handles(1, SubmitMethod::Web, 901, 900));
        // Other flavors queue everything.
        assert!(!Subcons.front_end_handles(1, SubmitMethod::Web, 10, 900));
    }

    #[test]
    fn pathopred_injects_variants() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("variants.fa"), ">v\nA12B\n").unwrap();
        let mut params = serde_json::Map::new();
        Pathopred.inject_params(&mut params, dir.path(), "sp|P1");
        assert_eq!(params["variants"], ">v\nA12B\n");
        assert_eq!(params["identifier_name"], "sp|P1");
    }
}
