//! Stamps the binary's startup banner with its build time and profile

fn main() {
    let built = chrono::Utc::now().format("%Y-%m-%d %H:%M UTC");
    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", built);
    println!("cargo:rustc-env=BUILD_PROFILE={}", profile);
    println!("cargo:rerun-if-changed=build.rs");
}
