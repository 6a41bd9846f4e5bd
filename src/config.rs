use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QdError, Result};

/// Which prediction server this daemon fronts. The variants differ in how
/// results are validated, summarized and keyed; see `flavor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Topcons2,
    Boctopus2,
    Pconsc3,
    Subcons,
    Prodres,
    Pathopred,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServerKind::Topcons2 => "topcons2",
            ServerKind::Boctopus2 => "boctopus2",
            ServerKind::Pconsc3 => "pconsc3",
            ServerKind::Subcons => "subcons",
            ServerKind::Prodres => "prodres",
            ServerKind::Pathopred => "pathopred",
        };
        write!(f, "{}", name)
    }
}

/// How a compute node queues work internally. Affects only the software
/// name sent along with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueDiscipline {
    Suq,
    Slurm,
}

impl std::fmt::Display for QueueDiscipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueDiscipline::Suq => write!(f, "suq"),
            QueueDiscipline::Slurm => write!(f, "slurm"),
        }
    }
}

/// One remote compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    /// host:port of the node's RPC endpoint.
    pub addr: String,
    /// Maximum tasks this node accepts per dispatcher pass.
    pub max_jobs: usize,
    #[serde(default = "default_queue")]
    pub queue: QueueDiscipline,
}

fn default_queue() -> QueueDiscipline {
    QueueDiscipline::Suq
}

/// Immutable configuration for one scheduling pass.
///
/// Constructed once (from a JSON file or the builder methods) and passed by
/// reference into every component; nothing here is mutated at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdConfig {
    pub server: ServerKind,
    /// Per-job directories live under here, one directory per job id.
    pub result_root: PathBuf,
    /// Submission/run/finished logs live here.
    pub log_root: PathBuf,
    /// Content-addressed result cache root.
    pub cache_root: PathBuf,
    pub nodes: Vec<NodeEntry>,

    /// Cache hits materialized per dispatcher invocation before the cache
    /// scan checkpoints and yields.
    pub max_cache_per_pass: usize,
    /// Submission attempts per sequence per pass before it is dropped from
    /// the to-run list as failed-to-submit.
    pub max_submit_try: u32,
    /// Observed remote failures before a sequence is permanently Failed.
    pub max_resubmit: u32,
    /// Seconds a non-running remote task may sit queued before it is
    /// reclaimed and resubmitted.
    pub max_remote_queue_secs: u64,
    /// Connect and per-call timeout for node RPCs.
    pub rpc_timeout_secs: u64,
    /// Queue age beyond which even front-end-eligible jobs are taken over
    /// by this daemon.
    pub upper_wait_secs: u64,

    /// Emails or IPs pinned to maximum priority.
    pub vip_users: Vec<String>,
    /// IPs whose priority is divided by 1000.
    pub black_list: Vec<String>,
}

impl Default for QdConfig {
    fn default() -> Self {
        Self {
            server: ServerKind::Topcons2,
            result_root: PathBuf::from("static/result"),
            log_root: PathBuf::from("static/log"),
            cache_root: PathBuf::from("static/cache"),
            nodes: Vec::new(),
            max_cache_per_pass: 50,
            max_submit_try: 3,
            max_resubmit: 2,
            max_remote_queue_secs: 24 * 3600,
            rpc_timeout_secs: 30,
            upper_wait_secs: 900,
            vip_users: Vec::new(),
            black_list: Vec::new(),
        }
    }
}

impl QdConfig {
    pub fn new(server: ServerKind, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            server,
            result_root: root.join("result"),
            log_root: root.join("log"),
            cache_root: root.join("cache"),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, addr: impl Into<String>, max_jobs: usize) -> Self {
        self.nodes.push(NodeEntry {
            addr: addr.into(),
            max_jobs,
            queue: QueueDiscipline::Suq,
        });
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| QdError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Directory holding all state for one job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.result_root.join(job_id)
    }

    pub fn is_vip(&self, email: &str, ip: &str) -> bool {
        (!email.is_empty() && self.vip_users.iter().any(|v| v == email))
            || (!ip.is_empty() && self.vip_users.iter().any(|v| v == ip))
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        !ip.is_empty() && self.black_list.iter().any(|b| b == ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = QdConfig::default();
        assert_eq!(cfg.max_cache_per_pass, 50);
        assert_eq!(cfg.max_submit_try, 3);
        assert_eq!(cfg.max_resubmit, 2);
        assert_eq!(cfg.max_remote_queue_secs, 24 * 3600);
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn with_node_appends() {
        let cfg = QdConfig::new(ServerKind::Subcons, "/srv/web")
            .with_node("10.0.0.1:50051", 8)
            .with_node("10.0.0.2:50051", 4);
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.nodes[0].addr, "10.0.0.1:50051");
        assert_eq!(cfg.nodes[0].max_jobs, 8);
        assert_eq!(cfg.nodes[1].queue, QueueDiscipline::Suq);
    }

    #[test]
    fn job_dir_is_under_result_root() {
        let cfg = QdConfig::new(ServerKind::Topcons2, "/srv/web");
        assert_eq!(
            cfg.job_dir("rst_XYZ"),
            PathBuf::from("/srv/web/result/rst_XYZ")
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: QdConfig = serde_json::from_str(
            r#"{"server": "pconsc3", "nodes": [{"addr": "n1:9090", "max_jobs": 2}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.server, ServerKind::Pconsc3);
        assert_eq!(cfg.nodes[0].queue, QueueDiscipline::Suq);
        assert_eq!(cfg.max_submit_try, 3);
    }

    #[test]
    fn vip_and_blacklist_match_email_or_ip() {
        let mut cfg = QdConfig::default();
        cfg.vip_users = vec!["boss@example.org".into(), "192.0.2.7".into()];
        cfg.black_list = vec!["198.51.100.3".into()];
        assert!(cfg.is_vip("boss@example.org", ""));
        assert!(cfg.is_vip("", "192.0.2.7"));
        assert!(!cfg.is_vip("", ""));
        assert!(cfg.is_blacklisted("198.51.100.3"));
        assert!(!cfg.is_blacklisted(""));
    }
}
