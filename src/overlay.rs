use std::collections::BTreeMap;

use crate::tar::{normalize_path, TarEntry};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Collapse ordered per-layer entry lists (base layer first) into one merged
/// filesystem view with OCI overlay semantics: later layers override earlier
/// ones, `.wh.<name>` deletes `<name>` from earlier layers, and
/// `.wh..wh..opq` hides everything an earlier layer put inside its directory.
/// Whiteout markers themselves never appear in the output, which is sorted
/// by path.
pub fn merge_layers(layers: &[Vec<TarEntry>]) -> Vec<TarEntry> {
    let mut merged: BTreeMap<String, TarEntry> = BTreeMap::new();
    for layer in layers {
        // whiteouts act on the layers below before this layer's own content lands
        for entry in layer {
            let path = entry_key(entry);
            let (dir, base) = split_path(path);
            if base == OPAQUE_MARKER {
                let prefix = if dir.is_empty() {
                    String::new()
                } else {
                    format!("{dir}/")
                };
                merged.retain(|key, _| !key.starts_with(prefix.as_str()) || key == dir);
            } else if let Some(victim) = base.strip_prefix(WHITEOUT_PREFIX) {
                let victim = if dir.is_empty() {
                    victim.to_string()
                } else {
                    format!("{dir}/{victim}")
                };
                merged.remove(&victim);
                let subtree = format!("{victim}/");
                merged.retain(|key, _| !key.starts_with(&subtree));
            }
        }
        for entry in layer {
            let path = entry_key(entry);
            let (_, base) = split_path(path);
            if base.starts_with(WHITEOUT_PREFIX) {
                continue;
            }
            merged.insert(path.to_string(), entry.clone());
        }
    }
    merged.into_values().collect()
}

fn entry_key(entry: &TarEntry) -> &str {
    normalize_path(&entry.name).trim_end_matches('/')
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Contents of a single directory within a merged entry list
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub path: String,
    /// Parent path, `None` at the root
    pub parent: Option<String>,
    /// Direct children only, directories first
    pub entries: Vec<TarEntry>,
}

/// Filter `all_entries` down to the direct children of `current_path`.
/// Nested entries are dropped; duplicates (directories often appear in
/// several layers) collapse to their first occurrence.
pub fn directory_contents(all_entries: &[TarEntry], current_path: &str) -> DirectoryListing {
    let mut path = current_path.to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    let prefix = if path == "/" {
        ""
    } else {
        path.trim_start_matches('/')
    };

    let mut children: Vec<TarEntry> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for entry in all_entries {
        let name = normalize_path(&entry.name);
        let Some(relative) = name.strip_prefix(prefix) else {
            continue;
        };
        if relative.is_empty() {
            continue;
        }
        let base = relative.trim_end_matches('/');
        if base.contains('/') {
            continue;
        }
        if seen.insert(base.to_string()) {
            children.push(entry.clone());
        }
    }
    children.sort_by_key(|entry| (!entry.is_dir(), entry.name.to_lowercase()));

    let parent = if path == "/" {
        None
    } else {
        let trimmed = path.trim_end_matches('/');
        Some(match trimmed.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => format!("{parent}/"),
            _ => "/".to_string(),
        })
    };

    DirectoryListing {
        path,
        parent,
        entries: children,
    }
}
