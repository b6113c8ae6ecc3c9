/// Version banner: crate version plus what the binary is for
pub fn banner() -> String {
    format!(
        "courier {}\nEmoji device verification and news digests for federated chat",
        env!("CARGO_PKG_VERSION")
    )
}

pub fn execute() {
    println!("{}", banner());
}
