pub mod collect;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fasta;
pub mod flavor;
pub mod joblog;
pub mod lock;
pub mod nodes;
pub mod rpc;
pub mod store;

// Re-export generated protobuf types.
//
// The bindings are normally emitted by the build script via tonic-build +
// prost-build, which shells out to `protoc`. This build environment has no
// `protoc`, so the equivalent generated output is vendored in
// `proto_compute.rs` and included here instead.
pub mod proto {
    include!("proto_compute.rs");
}
