pub fn run() -> anyhow::Result<()> {
    println!("packplane {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
