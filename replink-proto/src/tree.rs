//! Filesystem tree built from the walk script output.

use serde::{Deserialize, Serialize};

/// Kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Entry whose `stat` failed.
    Unknown,
}

/// One entry of the device filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FsNode {
    /// Last path component.
    pub name: String,
    /// Absolute path on the device.
    pub path: String,
    /// Entry kind.
    pub kind: NodeKind,
    /// Size in bytes, files only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Directory contents in listing order.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub children: Vec<Self>,
}

impl FsNode {
    /// Creates a directory node.
    fn dir(name: &str, path: String) -> Self {
        Self {
            name: name.to_owned(),
            path,
            kind: NodeKind::Dir,
            size: None,
            children: Vec::new(),
        }
    }
}

/// Builds the tree from `kind|path|size` lines.
///
/// Parent directories are created on demand so the result does not depend on
/// the device printing a `d` line before its contents. Lines that do not have
/// three fields, an absolute path or a known kind are skipped.
pub fn parse_walk(output: &str) -> Vec<FsNode> {
    let mut roots = Vec::new();
    for line in output.lines() {
        let mut fields = line.trim().splitn(3, '|');
        let (Some(kind), Some(path), Some(size)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let kind = match kind {
            "f" => NodeKind::File,
            "d" => NodeKind::Dir,
            "?" => NodeKind::Unknown,
            _ => continue,
        };
        if !path.starts_with('/') {
            continue;
        }
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, parents)) = segments.split_last() else {
            continue;
        };

        let mut level = &mut roots;
        let mut prefix = String::new();
        for seg in parents {
            prefix.push('/');
            prefix.push_str(seg);
            level = descend(level, seg, &prefix);
        }
        if kind == NodeKind::Dir {
            descend(level, leaf, path);
        } else {
            level.push(FsNode {
                name: (*leaf).to_owned(),
                path: path.to_owned(),
                kind,
                size: (kind == NodeKind::File).then(|| size.trim().parse().unwrap_or(0)),
                children: Vec::new(),
            });
        }
    }
    roots
}

/// Returns the children of directory `name` in `level`, creating it if missing.
fn descend<'a>(level: &'a mut Vec<FsNode>, name: &str, path: &str) -> &'a mut Vec<FsNode> {
    let idx = match level.iter().position(|n| n.kind == NodeKind::Dir && n.name == name) {
        Some(idx) => idx,
        None => {
            level.push(FsNode::dir(name, path.to_owned()));
            level.len() - 1
        }
    };
    &mut level[idx].children
}
