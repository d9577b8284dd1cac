fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/plum/task/v1/task.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/plum/task/v1/task.proto");
    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
