// build.rs
use tonic_prost_build::configure;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: build scripts are single-threaded.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }

    println!("cargo:rerun-if-changed=proto/log.proto");
    configure().compile_protos(&["proto/log.proto"], &["proto"])?;

    Ok(())
}
