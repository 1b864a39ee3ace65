use std::path::{Path, PathBuf};
use std::process::Command;
use std::fs;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and package retransmon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the complete binary (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Package a release binary with its env example and systemd unit
    Package {
        /// Target triple
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut path = root.join("target");
    if let Some(t) = target {
        path.push(t);
    }
    path.join(profile).join("retransmon")
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root();

    println!("Building retransmon...");

    // Linux target from a non-Linux host goes through `cross`
    let is_cross_compile =
        target.map(|t| t.contains("linux")).unwrap_or(false) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root).arg("build").arg("-p").arg("retransmon");

    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let binary = binary_path(&root, release, target);
    println!("Build complete: {}", binary.display());
    Ok(binary)
}

fn systemd_unit(env_file: &str) -> String {
    format!(
        r#"[Unit]
Description=retransmon TCP retransmission exporter
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/retransmon
Restart=on-failure
RestartSec=5
EnvironmentFile=-{}

CapabilityBoundingSet=CAP_BPF CAP_PERFMON CAP_SYS_RESOURCE CAP_SYS_ADMIN
AmbientCapabilities=CAP_BPF CAP_PERFMON CAP_SYS_RESOURCE CAP_SYS_ADMIN

[Install]
WantedBy=multi-user.target
"#,
        env_file
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root();
    let output_path = root.join(output_dir);

    let arch = target.unwrap_or(std::env::consts::ARCH);
    let package_name = format!("retransmon-{}-{}", env!("CARGO_PKG_VERSION"), arch);
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir).context("Failed to create package directory")?;

    fs::copy(&binary, package_dir.join("retransmon"))?;

    let env_example = root.join("example.env");
    if env_example.exists() {
        fs::copy(&env_example, package_dir.join("retransmon.env.example"))?;
    }

    fs::write(
        package_dir.join("retransmon.service"),
        systemd_unit("/etc/retransmon/retransmon.env"),
    )?;

    let install_script = r#"#!/bin/bash
set -e

INSTALL_DIR="${INSTALL_DIR:-/usr/local/bin}"
CONFIG_DIR="${CONFIG_DIR:-/etc/retransmon}"

sudo install -m 755 retransmon "$INSTALL_DIR/retransmon"

sudo mkdir -p "$CONFIG_DIR"
if [ -f retransmon.env.example ] && [ ! -f "$CONFIG_DIR/retransmon.env" ]; then
    sudo cp retransmon.env.example "$CONFIG_DIR/retransmon.env"
fi

sudo install -m 644 retransmon.service /etc/systemd/system/retransmon.service
sudo systemctl daemon-reload
sudo systemctl enable retransmon

echo "Installed. Start with: sudo systemctl start retransmon"
"#;
    fs::write(package_dir.join("install.sh"), install_script)?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to create tarball")?;
    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;

    println!("Package created: {}", tarball.display());
    Ok(())
}
