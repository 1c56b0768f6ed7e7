fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/peer_scheduler/v1/peer_scheduler.proto"], &["proto"])?;
    Ok(())
}
