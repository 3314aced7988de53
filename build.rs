use std::env;
use std::path::PathBuf;

const SRC: &str = "src/bpf/tailtrace.bpf.c";

#[cfg(not(feature = "embed-bpf"))]
fn build_bpf_object(_out_dir: &PathBuf) {}

#[cfg(feature = "embed-bpf")]
fn build_bpf_object(out_dir: &PathBuf) {
    use libbpf_cargo::SkeletonBuilder;
    use std::ffi::OsStr;

    let include_arg = format!("-I{}", out_dir.display());
    SkeletonBuilder::new()
        .source(SRC)
        .obj(out_dir.join("tailtrace.bpf.o"))
        .clang_args([OsStr::new(&include_arg)])
        .build()
        .expect("Failed to build BPF object");
}

fn main() {
    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR must be set in build script"));

    build_bpf_object(&out_dir);
    println!("cargo:rerun-if-changed={}", SRC);
}
