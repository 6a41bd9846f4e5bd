// The protobuf/gRPC bindings for proto/compute.proto are normally generated
// here via tonic-build (which shells out to `protoc`). This build environment
// provides no `protoc` and no network access to install one, so the generated
// output is vendored in src/proto_compute.rs instead. We keep the rerun hints
// so the vendored file can be regenerated when the proto changes in an
// environment that does have protoc.
fn main() {
    println!("cargo:rerun-if-changed=proto/compute.proto");
    println!("cargo:rerun-if-changed=proto");
}
