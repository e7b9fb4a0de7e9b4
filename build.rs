/// Build script
/// Injects the application identity into the crate so the binary, the
/// config directory and the status log all agree on one name.
use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CONTROLPANEL_APP_NAME");

    let name = env::var("CONTROLPANEL_APP_NAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "Control Panel".to_string());
    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.1.0".to_string());
    let package = env::var("CARGO_PKG_NAME").unwrap_or_else(|_| "controlpanel".to_string());

    // Normalize name for file system use (lowercase, alphanumeric + hyphens only)
    let app_id = package
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect::<String>();

    // Inject into Rust code via environment variables (accessible with env!() macro)
    println!("cargo:rustc-env=APP_NAME={}", name);
    println!("cargo:rustc-env=APP_VERSION={}", version);
    println!("cargo:rustc-env=APP_ID={}", app_id);
}
