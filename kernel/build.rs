use std::{env, path::PathBuf};

fn main() {
    let target = env::var("TARGET").expect("TARGET not set");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let kernel_dir = PathBuf::from(manifest_dir);

    // Bare-metal x86 targets link against our Multiboot layout. Hosted
    // builds (unit tests) use the platform defaults.
    if target.contains("-none") && (target.starts_with("i386") || target.starts_with("i486") || target.starts_with("i586") || target.starts_with("i686")) {
        let linker_script = kernel_dir.join("src/arch/x86/link.ld");
        println!("cargo:rustc-link-arg=-T{}", linker_script.display());
    }

    println!("cargo:rerun-if-changed=src/arch/x86/link.ld");
}
