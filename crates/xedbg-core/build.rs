//! Build script for xedbg-core
//!
//! Verifies the toolchain before compilation. The workspace relies on the
//! `[lints]` manifest table, which needs Rust 1.74 or newer.

const MIN_RUST_VERSION: &str = "1.74.0";

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    let Ok(found) = rustc_version::version() else {
        // Some build environments hide rustc; do not fail the build for that.
        println!("cargo:warning=could not verify Rust version");
        return;
    };

    match rustc_version::Version::parse(MIN_RUST_VERSION) {
        Ok(minimum) if found < minimum => {
            panic!("xedbg-core requires Rust {minimum} or newer, found {found}");
        }
        Ok(_) => {}
        Err(err) => println!("cargo:warning=invalid minimum Rust version {MIN_RUST_VERSION}: {err}"),
    }
}
