/// Builds the gRPC client and server code for `proto/token_renewer.proto`
/// using `tonic-prost-build`.
///
/// # Byte Field Optimization
///
/// The `payload` fields of `RpcRequest` and `RpcResponse` carry already
/// encoded protobuf messages. They are generated as `bytes::Bytes` so the
/// multiplexer can hand them around without copying.
///
/// # Output
///
/// Generated code is included through:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("tokenrenewer.v1");
/// }
/// ```
///
/// A file descriptor set is written next to it for gRPC reflection.
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("token_renewer_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([
            ".tokenrenewer.v1.RpcRequest.payload",
            ".tokenrenewer.v1.RpcResponse.payload",
        ])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/token_renewer.proto"], &["proto"])
        .unwrap();
}
