//! Build script for snare-core
//!
//! This script checks build requirements before compilation:
//! - Minimum Rust version (1.70: `OnceLock`, `Option::is_some_and`)
//! - Target platform (the engine compiles everywhere, but only the Windows
//!   backend can drive a real debuggee)
//!
//! ## Requirements
//!
//! - **Rust**: 1.70 or newer
//! - **Windows**: x86-64 host for live debugging (32-bit targets run under WOW64)

use std::env;

fn main()
{
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 70, 0);

        if rustc_version < min_rust_version {
            panic!(
                "snare-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_target_platform();
}

fn check_target_platform()
{
    // Cargo exposes the *target* configuration to build scripts through
    // environment variables; `cfg!(windows)` here would describe the host.
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    if target_os != "windows" {
        println!(
            "cargo:warning=snare-core: no live debugging backend for target os '{target_os}'; \
             only the platform-independent engine will be built"
        );
        return;
    }

    if target_arch != "x86_64" {
        println!(
            "cargo:warning=snare-core: the Windows backend reads thread contexts with the AMD64/WOW64 layouts; \
             target arch '{target_arch}' is not supported"
        );
    }
}
