//! Device filesystem commands: cat, get, put, ls, df, mkdir, rm, rmdir, touch.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use replink::WriteOptions;
use replink_proto::{FsNode, NodeKind};

use crate::OutputFormat;
use crate::session::{Session, finish};

/// Arguments for `replink put`.
#[derive(clap::Args, Debug)]
pub struct PutArgs {
    /// Host file to upload.
    pub local: PathBuf,

    /// Device path. Defaults to the file name under `/`; a trailing `/`
    /// uploads into that directory.
    pub remote: Option<String>,

    /// Write straight to the destination instead of a temp file plus rename.
    #[arg(long)]
    pub direct: bool,

    /// Bytes per transfer chunk.
    #[arg(long, default_value_t = 128)]
    pub chunk_size: usize,

    /// Compare SHA-256 digests after the upload.
    #[arg(long)]
    pub verify: bool,
}

/// Single-path edits.
#[derive(Debug, Clone, Copy)]
pub enum Edit {
    /// `mkdir -p`.
    Mkdir,
    /// Remove a file.
    Rm,
    /// Remove an empty directory.
    Rmdir,
    /// Create an empty file if missing.
    Touch,
}

impl Edit {
    /// Command name.
    const fn verb(self) -> &'static str {
        match self {
            Self::Mkdir => "mkdir",
            Self::Rm => "rm",
            Self::Rmdir => "rmdir",
            Self::Touch => "touch",
        }
    }
}

/// Prints a device file to stdout.
pub async fn cat(session: &Session, path: &str) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = repl.read_file(path).await;
    let data = finish(repl, res).await.with_context(|| format!("cannot read {path}"))?;
    let mut out = std::io::stdout().lock();
    out.write_all(&data)?;
    out.flush()?;
    Ok(())
}

/// Downloads `remote` to `local`.
pub async fn get(session: &Session, remote: &str, local: Option<&Path>) -> Result<()> {
    let target = local_target(remote, local)?;
    let mut repl = session.raw().await?;
    let res = repl.read_file(remote).await;
    let data = finish(repl, res).await.with_context(|| format!("cannot read {remote}"))?;
    std::fs::write(&target, &data).with_context(|| format!("cannot write {}", target.display()))?;
    println!("{remote} -> {} ({})", target.display(), human_size(data.len() as u64));
    Ok(())
}

/// Uploads a host file.
pub async fn put(session: &Session, args: &PutArgs) -> Result<()> {
    let data = std::fs::read(&args.local)
        .with_context(|| format!("cannot read {}", args.local.display()))?;
    let remote = remote_target(&args.local, args.remote.as_deref())?;
    let mut options = WriteOptions::default();
    options.chunk_size = args.chunk_size;
    options.direct = args.direct;
    options.verify = args.verify;

    let mut repl = session.raw().await?;
    let res = repl.write_file(&remote, &data, &options).await;
    finish(repl, res).await.with_context(|| format!("cannot write {remote}"))?;
    println!("{} -> {remote} ({})", args.local.display(), human_size(data.len() as u64));
    Ok(())
}

/// Lists the whole device filesystem.
pub async fn ls(session: &Session, format: OutputFormat) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = repl.walk_fs().await;
    let tree = finish(repl, res).await?;

    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }
    if tree.is_empty() {
        println!("No files.");
    }
    for line in tree_lines(&tree) {
        println!("{line}");
    }
    Ok(())
}

/// Prints filesystem usage for the mount holding `path`.
pub async fn df(session: &Session, path: &str) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = repl.fs_stats(path).await;
    let stats = finish(repl, res).await?;
    println!("{:<12} {:>10} {:>10} {:>10}", "MOUNT", "USED", "FREE", "TOTAL");
    println!(
        "{:<12} {:>10} {:>10} {:>10}",
        path,
        human_size(stats.used),
        human_size(stats.free),
        human_size(stats.total)
    );
    Ok(())
}

/// Applies a single-path edit.
pub async fn edit(session: &Session, edit: Edit, path: &str) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = match edit {
        Edit::Mkdir => repl.make_path(path).await,
        Edit::Rm => repl.remove_file(path).await,
        Edit::Rmdir => repl.remove_dir(path).await,
        Edit::Touch => repl.touch_file(path).await,
    };
    finish(repl, res).await.with_context(|| format!("{} {path} failed", edit.verb()))
}

/// Host path for a download: the remote file name in the current directory,
/// or inside `local` when that names a directory.
fn local_target(remote: &str, local: Option<&Path>) -> Result<PathBuf> {
    let name = remote.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    match local {
        Some(dir) if dir.is_dir() => {
            if name.is_empty() {
                bail!("{remote:?} has no file name");
            }
            Ok(dir.join(name))
        }
        Some(path) => Ok(path.to_path_buf()),
        None if name.is_empty() => bail!("{remote:?} has no file name"),
        None => Ok(PathBuf::from(name)),
    }
}

/// Device path for an upload.
fn remote_target(local: &Path, remote: Option<&str>) -> Result<String> {
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", local.display()))?;
    Ok(match remote {
        None => format!("/{name}"),
        Some(dir) if dir.ends_with('/') => format!("{dir}{name}"),
        Some(path) => path.to_owned(),
    })
}

/// Renders the tree one entry per line, directories with a trailing `/`.
fn tree_lines(nodes: &[FsNode]) -> Vec<String> {
    let mut lines = Vec::new();
    push_lines(nodes, 0, &mut lines);
    lines
}

/// Depth-first helper for [`tree_lines`].
fn push_lines(nodes: &[FsNode], depth: usize, lines: &mut Vec<String>) {
    for node in nodes {
        let name = format!("{:indent$}{}", "", node.name, indent = depth * 2);
        match node.kind {
            NodeKind::Dir => {
                lines.push(format!("{name}/"));
                push_lines(&node.children, depth + 1, lines);
            }
            NodeKind::File => {
                lines.push(format!("{name:<40} {:>10}", human_size(node.size.unwrap_or(0))));
            }
            _ => lines.push(format!("{name:<40} {:>10}", "?")),
        }
    }
}

/// Formats bytes into a human-readable size string.
#[allow(clippy::cast_precision_loss)]
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}
