// Vendored protobuf/gRPC bindings for proto/compute.proto.
//
// Normally produced at build time by tonic-build + prost-build from the
// `.proto`, but this build environment has no `protoc` available, so the
// equivalent generated output is checked in here and `include!`d from the
// `proto` module (see src/lib.rs). Keep in sync with proto/compute.proto.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitSequenceRequest {
    /// Single-record FASTA text.
    #[prost(string, tag = "1")]
    pub fasta: ::prost::alloc::string::String,
    /// Canonical (sorted-key) JSON encoding of the job parameters.
    #[prost(string, tag = "2")]
    pub params_json: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub job_name: ::prost::alloc::string::String,
    /// Empty unless the submitter is privileged.
    #[prost(string, tag = "4")]
    pub email: ::prost::alloc::string::String,
    /// Total outstanding sequences for this user, for remote-side fairness.
    #[prost(uint32, tag = "5")]
    pub user_seq_count: u32,
    #[prost(bool, tag = "6")]
    pub force_run: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubmitSequenceReply {
    /// Empty or "None" means the submission was rejected.
    #[prost(string, tag = "1")]
    pub remote_job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub result_url: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub seq_count: u32,
    #[prost(string, tag = "4")]
    pub err_info: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub warn_info: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckJobRequest {
    #[prost(string, tag = "1")]
    pub remote_job_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckJobReply {
    /// One of Wait, Running, Finished, Failed, None; anything else is
    /// treated as unknown by the caller.
    #[prost(string, tag = "1")]
    pub status: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub result_url: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub err_info: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteJobRequest {
    #[prost(string, tag = "1")]
    pub remote_job_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteJobReply {
    #[prost(string, tag = "1")]
    pub status: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub err_msg: ::prost::alloc::string::String,
}
/// Generated client implementations.
pub mod compute_node_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;
    /// RPC surface of a remote compute node. This crate only consumes it:
    /// submissions are fanned out per sequence, completion is polled, and
    /// retrieved results are deleted from the node best-effort.
    #[derive(Debug, Clone)]
    pub struct ComputeNodeClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl ComputeNodeClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> ComputeNodeClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }
        pub fn with_interceptor<F>(
            inner: T,
            interceptor: F,
        ) -> ComputeNodeClient<InterceptedService<T, F>>
        where
            F: tonic::service::Interceptor,
            T::ResponseBody: Default,
            T: tonic::codegen::Service<
                http::Request<tonic::body::BoxBody>,
                Response = http::Response<
                    <T as tonic::client::GrpcService<tonic::body::BoxBody>>::ResponseBody,
                >,
            >,
            <T as tonic::codegen::Service<http::Request<tonic::body::BoxBody>>>::Error:
                Into<StdError> + Send + Sync,
        {
            ComputeNodeClient::new(InterceptedService::new(inner, interceptor))
        }
        /// Compress requests with the given encoding.
        ///
        /// This requires the server to support it otherwise it might respond with an
        /// error.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.send_compressed(encoding);
            self
        }
        /// Enable decompressing responses.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.accept_compressed(encoding);
            self
        }
        pub async fn submit_sequence(
            &mut self,
            request: impl tonic::IntoRequest<super::SubmitSequenceRequest>,
        ) -> Result<tonic::Response<super::SubmitSequenceReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/compute.ComputeNode/SubmitSequence");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn check_job(
            &mut self,
            request: impl tonic::IntoRequest<super::CheckJobRequest>,
        ) -> Result<tonic::Response<super::CheckJobReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/compute.ComputeNode/CheckJob");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn delete_job(
            &mut self,
            request: impl tonic::IntoRequest<super::DeleteJobRequest>,
        ) -> Result<tonic::Response<super::DeleteJobReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/compute.ComputeNode/DeleteJob");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}
