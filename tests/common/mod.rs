//! Shared helpers for integration tests: scratch job trees and an
//! in-memory fake compute node standing in for the RPC surface.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use predqd::config::{QdConfig, ServerKind};
use predqd::error::{QdError, Result};
use predqd::rpc::{
    CheckOutcome, NodeClient, NodeConnector, RemoteStatus, SubmitOutcome, SubmitRequest,
};
use predqd::store::cache::pack_tar_gz;
use predqd::store::{JobInfo, SubmitMethod, TaskStore};

pub fn test_config(root: &Path, server: ServerKind) -> QdConfig {
    let cfg = QdConfig::new(server, root);
    std::fs::create_dir_all(&cfg.result_root).unwrap();
    std::fs::create_dir_all(&cfg.log_root).unwrap();
    std::fs::create_dir_all(&cfg.cache_root).unwrap();
    cfg
}

/// Create a job directory with a query file and jobinfo record.
pub fn make_job(
    cfg: &QdConfig,
    job_id: &str,
    seqs: &[(&str, &str)],
    ip: &str,
    email: &str,
) -> TaskStore {
    let dir = cfg.job_dir(job_id);
    std::fs::create_dir_all(&dir).unwrap();
    let mut fasta = String::new();
    for (anno, seq) in seqs {
        fasta.push_str(&format!(">{}\n{}\n", anno, seq));
    }
    std::fs::write(dir.join("query.fa"), fasta).unwrap();
    std::fs::write(dir.join("jobinfo"), job_info(job_id, seqs.len(), ip, email).to_line()).unwrap();
    TaskStore::open(dir)
}

pub fn job_info(job_id: &str, numseq: usize, ip: &str, email: &str) -> JobInfo {
    JobInfo {
        submit_date: "2026-08-01 10:00:00".into(),
        job_id: job_id.into(),
        ip: ip.into(),
        numseq,
        raw_size: 100,
        job_name: "test job".into(),
        email: email.into(),
        method: SubmitMethod::Api,
    }
}

/// A tar.gz shaped like a fetched remote result: `<remote_id>/seq_0/...`
/// with a time file and, optionally, the topcons completeness marker.
pub fn build_result_archive(scratch: &Path, remote_id: &str, with_marker: bool) -> PathBuf {
    let staging = scratch.join(format!("staging_{}", remote_id));
    let seq0 = staging.join("seq_0");
    std::fs::create_dir_all(&seq0).unwrap();
    std::fs::write(seq0.join("time.txt"), "docker_topcons2;12.5\n").unwrap();
    std::fs::write(seq0.join("seq.fa"), ">normalized\nMKT\n").unwrap();
    if with_marker {
        std::fs::create_dir_all(seq0.join("Topcons")).unwrap();
        std::fs::write(seq0.join("Topcons/topcons.top"), "iiMMMMoooMMMMii").unwrap();
    }
    let out = scratch.join(format!("{}.tar.gz", remote_id));
    pack_tar_gz(&staging, remote_id, &out).unwrap();
    out
}

// ---------------------------------------------------------------------
// Fake node
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct NodeState {
    pub reachable: bool,
    pub accept: bool,
    pub check_errors: bool,
    pub submissions: Vec<SubmitRequest>,
    pub next_id: usize,
    /// remote id -> (status string, result url, err info)
    pub status: HashMap<String, (String, String, String)>,
    /// result url -> archive file served on fetch
    pub archives: HashMap<String, PathBuf>,
    pub deleted: Vec<String>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            reachable: true,
            accept: true,
            check_errors: false,
            submissions: Vec::new(),
            next_id: 0,
            status: HashMap::new(),
            archives: HashMap::new(),
            deleted: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

impl FakeNode {
    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    pub fn set_status(&self, remote_id: &str, status: &str, url: &str) {
        self.state().status.insert(
            remote_id.into(),
            (status.into(), url.into(), String::new()),
        );
    }

    pub fn serve_archive(&self, url: &str, archive: &Path) {
        self.state().archives.insert(url.into(), archive.into());
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub nodes: HashMap<String, FakeNode>,
}

impl FakeConnector {
    pub fn single(addr: &str) -> (Self, FakeNode) {
        let node = FakeNode::default();
        let mut nodes = HashMap::new();
        nodes.insert(addr.to_string(), node.clone());
        (Self { nodes }, node)
    }

    pub fn add(&mut self, addr: &str) -> FakeNode {
        let node = FakeNode::default();
        self.nodes.insert(addr.to_string(), node.clone());
        node
    }
}

#[async_trait]
impl NodeConnector for FakeConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn NodeClient>> {
        let node = self
            .nodes
            .get(addr)
            .ok_or_else(|| QdError::Rpc(tonic::Status::unavailable("unknown node")))?;
        if !node.state().reachable {
            return Err(QdError::Rpc(tonic::Status::unavailable("node down")));
        }
        Ok(Box::new(FakeClient {
            state: node.state.clone(),
        }))
    }
}

struct FakeClient {
    state: Arc<Mutex<NodeState>>,
}

#[async_trait]
impl NodeClient for FakeClient {
    async fn submit_sequence(&self, req: SubmitRequest) -> Result<SubmitOutcome> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push(req);
        if !state.accept {
            return Ok(SubmitOutcome {
                remote_job_id: String::new(),
                result_url: String::new(),
                seq_count: 0,
                err_info: "remote queue full".into(),
                warn_info: String::new(),
            });
        }
        let remote_id = format!("remote_{}", state.next_id);
        state.next_id += 1;
        let url = format!("fake://{}", remote_id);
        state
            .status
            .insert(remote_id.clone(), ("Wait".into(), url.clone(), String::new()));
        Ok(SubmitOutcome {
            remote_job_id: remote_id,
            result_url: url,
            seq_count: 1,
            err_info: String::new(),
            warn_info: String::new(),
        })
    }

    async fn check_job(&self, remote_id: &str) -> Result<CheckOutcome> {
        let state = self.state.lock().unwrap();
        if state.check_errors {
            return Err(QdError::Rpc(tonic::Status::unavailable("check down")));
        }
        match state.status.get(remote_id) {
            Some((status, url, err)) => Ok(CheckOutcome {
                status: RemoteStatus::parse(status),
                result_url: url.clone(),
                err_info: err.clone(),
            }),
            None => Ok(CheckOutcome {
                status: RemoteStatus::Missing,
                result_url: String::new(),
                err_info: format!("job {} does not exist", remote_id),
            }),
        }
    }

    async fn delete_job(&self, remote_id: &str) -> Result<()> {
        self.state.lock().unwrap().deleted.push(remote_id.into());
        Ok(())
    }

    async fn fetch_result(&self, url: &str, dest: &Path) -> Result<()> {
        let src = self
            .state
            .lock()
            .unwrap()
            .archives
            .get(url)
            .cloned()
            .ok_or_else(|| QdError::Corrupt(format!("no archive served for {}", url)))?;
        std::fs::copy(&src, dest).map_err(|e| QdError::io(dest, e))?;
        Ok(())
    }
}
