//! Build script for cfs-preload
//!
//! Compiles the C side of the list-form exec exports (`execl`, `execle`,
//! `execlp`). Rust cannot define C-variadic functions; the C compiler walks
//! the `va_list` and hands an argument vector back to the Rust shims.

fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_os == "linux" && (target_arch == "x86_64" || target_arch == "aarch64") {
        println!("cargo:rerun-if-changed=src/c/variadic_exec.c");

        cc::Build::new()
            .file("src/c/variadic_exec.c")
            .opt_level(2)
            .warnings(true)
            .compile("cfs_variadic_exec");
    }
}
