fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Deployments stamp the commit hash into the binary for /health
    println!("cargo:rerun-if-env-changed=OPSRUNBOOK_GIT_HASH");
    if let Ok(hash) = std::env::var("OPSRUNBOOK_GIT_HASH") {
        println!("cargo:rustc-env=OPSRUNBOOK_GIT_HASH={}", hash);
    }
}
