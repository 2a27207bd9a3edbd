use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Command;

const EBPF_PACKAGE: &str = "kmemtrack-ebpf";
/// Binary name of `kmemtrack-ebpf`, and the file `kmemtrack` loads by default
const EBPF_OBJECT: &str = "kmemtrack";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kmem tracepoint programs into a loadable eBPF object
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Toolchain with `-Z build-std` support
        #[arg(long, default_value = "nightly")]
        toolchain: String,
        /// Also copy the object here, for use with `kmemtrack --bpf-object`
        #[arg(long, value_name = "PATH")]
        install: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, toolchain, install } => {
            let object = build_ebpf(&workspace_root(), &target, &toolchain)?;
            if let Some(dest) = install {
                std::fs::copy(&object, &dest)
                    .with_context(|| format!("Failed to copy {} to {}", object.display(), dest.display()))?;
                println!("  Installed: {}", dest.display());
            }
        }
    }

    Ok(())
}

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
}

/// Where cargo leaves the object for `target`
fn object_path(root: &Path, target: &str) -> PathBuf {
    root.join("target").join(target).join("release").join(EBPF_OBJECT)
}

fn build_ebpf(root: &Path, target: &str, toolchain: &str) -> Result<PathBuf> {
    // Debug builds pull in formatting code the BPF linker rejects
    let status = Command::new("cargo")
        .current_dir(root)
        .arg(format!("+{toolchain}"))
        .args(["build", "--package", EBPF_PACKAGE, "--release", "--target", target])
        .args(["-Z", "build-std=core"])
        .status()
        .with_context(|| format!("Failed to run cargo +{toolchain}"))?;
    if !status.success() {
        bail!("Building {EBPF_PACKAGE} failed ({status})");
    }

    let object = object_path(root, target);
    let size = check_object(&object)?;
    println!("eBPF object built");
    println!("  Target: {target}");
    println!("  Object: {} ({size} bytes)", object.display());
    Ok(object)
}

/// Confirm cargo left an ELF file behind and return its size
fn check_object(path: &Path) -> Result<u64> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Build succeeded but {} is missing", path.display()))?;
    if !bytes.starts_with(b"\x7fELF") {
        bail!("{} is not an ELF object", path.display());
    }
    Ok(bytes.len() as u64)
}
