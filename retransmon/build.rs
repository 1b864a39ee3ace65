use std::{env, path::PathBuf, process::Command};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    let ebpf_dir = manifest_dir.join("../retransmon-ebpf");
    let common_dir = manifest_dir.join("../retransmon-common");

    println!("cargo:rerun-if-changed={}", ebpf_dir.join("src").display());
    println!("cargo:rerun-if-changed={}", common_dir.join("src").display());

    // The record is written in host byte order, so the probe must match the
    // target's endianness.
    let endian = env::var("CARGO_CFG_TARGET_ENDIAN").unwrap();
    let bpf_target = match endian.as_str() {
        "big" => "bpfeb-unknown-none",
        _ => "bpfel-unknown-none",
    };

    println!(
        "cargo:warning=Building eBPF for target: {} ({}-endian host)",
        bpf_target, endian
    );

    // Separate target directory so the nested cargo doesn't wait on our lock
    let ebpf_target_dir = out_dir.join("ebpf-target");

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(&ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC")
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .expect("Failed to execute cargo command");

    if !status.success() {
        panic!("Failed to build retransmon-ebpf");
    }

    let ebpf_binary = ebpf_target_dir.join(format!("{}/release/retransmon", bpf_target));
    std::fs::copy(&ebpf_binary, out_dir.join("retransmon"))
        .expect("Failed to copy eBPF object file");
}
