use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    tonic_build::configure()
        .build_server(true)
        .build_client(false)
        .file_descriptor_set_path(out_dir.join("dispatch.bin"))
        .compile_protos(&["proto/bifrost/v1/dispatch.proto"], &["proto"])?;
    Ok(())
}
