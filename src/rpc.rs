//! Client side of the compute-node RPC surface.
//!
//! The scheduling passes only ever talk to nodes through the `NodeClient`
//! trait so tests can substitute an in-memory node; the real implementation
//! is a tonic channel with bounded connect and per-call timeouts plus an
//! HTTP download for result archives.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use crate::error::Result;
use crate::proto::compute_node_client::ComputeNodeClient;
use crate::proto::{CheckJobRequest, DeleteJobRequest, SubmitSequenceRequest};

/// Remote job state as reported by a node. The wire format is a loose
/// string; anything unrecognized maps to `Unknown`, which callers treat
/// the same as `Failed` (the node no longer vouches for the job).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Wait,
    Running,
    Finished,
    Failed,
    /// The node reported "None": it has no record of the job.
    Missing,
    Unknown,
}

impl RemoteStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Wait" => RemoteStatus::Wait,
            "Running" => RemoteStatus::Running,
            "Finished" => RemoteStatus::Finished,
            "Failed" => RemoteStatus::Failed,
            "None" => RemoteStatus::Missing,
            _ => RemoteStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub fasta: String,
    pub params_json: String,
    pub job_name: String,
    pub email: String,
    pub user_seq_count: u32,
    pub force_run: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub remote_job_id: String,
    pub result_url: String,
    pub seq_count: u32,
    pub err_info: String,
    pub warn_info: String,
}

impl SubmitOutcome {
    /// A node signals rejection with an empty or literal "None" job id.
    pub fn accepted(&self) -> bool {
        !self.remote_job_id.is_empty() && self.remote_job_id != "None"
    }
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub status: RemoteStatus,
    pub result_url: String,
    pub err_info: String,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn submit_sequence(&self, req: SubmitRequest) -> Result<SubmitOutcome>;

    async fn check_job(&self, remote_id: &str) -> Result<CheckOutcome>;

    async fn delete_job(&self, remote_id: &str) -> Result<()>;

    /// Download a finished result archive to `dest`.
    async fn fetch_result(&self, url: &str, dest: &Path) -> Result<()>;
}

#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Open a client for one node. Any failure here means the node is
    /// unreachable for the rest of the pass.
    async fn connect(&self, addr: &str) -> Result<Box<dyn NodeClient>>;
}

/// tonic-backed connector used by the daemon binary.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    timeout: Duration,
}

impl GrpcConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl NodeConnector for GrpcConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn NodeClient>> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        let channel = endpoint.connect().await?;
        let http = reqwest::Client::builder().timeout(self.timeout).build()?;
        Ok(Box::new(GrpcNodeClient {
            client: ComputeNodeClient::new(channel),
            http,
        }))
    }
}

pub struct GrpcNodeClient {
    client: ComputeNodeClient<Channel>,
    http: reqwest::Client,
}

#[async_trait]
impl NodeClient for GrpcNodeClient {
    async fn submit_sequence(&self, req: SubmitRequest) -> Result<SubmitOutcome> {
        let mut client = self.client.clone();
        let reply = client
            .submit_sequence(SubmitSequenceRequest {
                fasta: req.fasta,
                params_json: req.params_json,
                job_name: req.job_name,
                email: req.email,
                user_seq_count: req.user_seq_count,
                force_run: req.force_run,
            })
            .await?
            .into_inner();
        Ok(SubmitOutcome {
            remote_job_id: reply.remote_job_id,
            result_url: reply.result_url,
            seq_count: reply.seq_count,
            err_info: reply.err_info,
            warn_info: reply.warn_info,
        })
    }

    async fn check_job(&self, remote_id: &str) -> Result<CheckOutcome> {
        let mut client = self.client.clone();
        let reply = client
            .check_job(CheckJobRequest {
                remote_job_id: remote_id.to_string(),
            })
            .await?
            .into_inner();
        Ok(CheckOutcome {
            status: RemoteStatus::parse(&reply.status),
            result_url: reply.result_url,
            err_info: reply.err_info,
        })
    }

    async fn delete_job(&self, remote_id: &str) -> Result<()> {
        let mut client = self.client.clone();
        let reply = client
            .delete_job(DeleteJobRequest {
                remote_job_id: remote_id.to_string(),
            })
            .await?
            .into_inner();
        if reply.status != "Succeeded" {
            tracing::debug!(remote_id, status = %reply.status, err = %reply.err_msg, "Remote delete not confirmed");
        }
        Ok(())
    }

    async fn fetch_result(&self, url: &str, dest: &Path) -> Result<()> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        std::fs::write(dest, &bytes).map_err(|e| crate::error::QdError::io(dest, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_status_strings() {
        assert_eq!(RemoteStatus::parse("Wait"), RemoteStatus::Wait);
        assert_eq!(RemoteStatus::parse(" Running\n"), RemoteStatus::Running);
        assert_eq!(RemoteStatus::parse("Finished"), RemoteStatus::Finished);
        assert_eq!(RemoteStatus::parse("Failed"), RemoteStatus::Failed);
        assert_eq!(RemoteStatus::parse("None"), RemoteStatus::Missing);
        assert_eq!(RemoteStatus::parse(""), RemoteStatus::Unknown);
        assert_eq!(RemoteStatus::parse("busy"), RemoteStatus::Unknown);
    }

    #[test]
    fn rejection_is_an_empty_or_none_job_id() {
        let mut outcome = SubmitOutcome {
            remote_job_id: "rst_1".into(),
            result_url: String::new(),
            seq_count: 1,
            err_info: String::new(),
            warn_info: String::new(),
        };
        assert!(outcome.accepted());
        outcome.remote_job_id = "None".into();
        assert!(!outcome.accepted());
        outcome.remote_job_id.clear();
        assert!(!outcome.accepted());
    }
}
