use std::env;
use std::path::PathBuf;

const PROTO_ROOT: &str = "proto";

const PROTO_FILES: &[&str] = &[
    "proto/workload.proto",
    "proto/spire/api/agent/delegatedidentity/v1/delegatedidentity.proto",
];

fn main() -> Result<(), anyhow::Error> {
    for file in PROTO_FILES {
        println!("cargo:rerun-if-changed={file}");
    }
    println!("cargo:rerun-if-changed={PROTO_ROOT}/spire/api/types");

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    let mut proto_config = prost_build::Config::new();
    proto_config.bytes(["."]);

    let fds = protox::compile(PROTO_FILES, [PROTO_ROOT])?;

    // Servers are generated too; the integration tests stand up an in-process agent and broker.
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .out_dir(&out_dir)
        .compile_fds_with_config(fds, proto_config)?;

    Ok(())
}
