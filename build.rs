//! Build script for accel-dense.
//!
//! The default build needs nothing native. With the `cuda` feature,
//! `cudarc` locates the toolkit itself; this only reminds the builder
//! that one has to be installed.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    if std::env::var_os("CARGO_FEATURE_CUDA").is_some() {
        println!("cargo:warning=CUDA feature enabled, ensure the CUDA toolkit is installed");
    }
}
