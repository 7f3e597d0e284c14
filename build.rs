//! Build script for ondevice-session.
//!
//! Records the target triple for the capability probe. A native engine build would
//! also compile and link llama.cpp here (cc + bindgen); the bundled reference engine
//! needs neither.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target = std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=ONDEVICE_TARGET={target}");

    #[cfg(feature = "cuda")]
    {
        println!("cargo:warning=CUDA feature enabled, ensure the CUDA driver is installed");
    }
}
