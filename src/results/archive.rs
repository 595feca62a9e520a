// Timestamped archive lookup

use chrono::NaiveDateTime;
use std::sync::Arc;

use crate::models::Archive;
use crate::queue::completion::TIMESTAMP_FORMAT;
use crate::remote::{shell, RemoteChannel};
use crate::types::{StageError, StageResult};

const TARBALL: &str = ".tar.gz";
/// `YYYY_MM_DD_HH_MM`
const TIMESTAMP_LEN: usize = 16;

/// Trailing `_YYYY_MM_DD_HH_MM` of an archive name
pub fn parse_timestamp(name: &str) -> Option<NaiveDateTime> {
    let name = name.strip_suffix(TARBALL).unwrap_or(name);
    if name.len() <= TIMESTAMP_LEN || !name.is_char_boundary(name.len() - TIMESTAMP_LEN) {
        return None;
    }
    let (head, stamp) = name.split_at(name.len() - TIMESTAMP_LEN);
    if !head.ends_with('_') {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Interpret one entry of the remote root listing
pub fn archive_from_entry(root: &str, entry: &str) -> Archive {
    let (name, compressed) = match entry.strip_suffix(TARBALL) {
        Some(stem) => (stem, true),
        None => (entry, false),
    };
    Archive {
        name: name.to_string(),
        path: shell::join(root, name),
        compressed,
        timestamp: parse_timestamp(name),
    }
}

/// Most recent timestamped archive among the listed entries
pub fn latest_archive<'a>(root: &str, entries: impl IntoIterator<Item = &'a str>) -> Option<Archive> {
    entries
        .into_iter()
        .map(|entry| archive_from_entry(root, entry))
        .filter(|archive| archive.timestamp.is_some())
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)))
}

/// Find the archive to retrieve from. An explicit name wins and must exist
/// (as a folder or as `.tar.gz`); otherwise the newest timestamped entry of
/// `root` is chosen.
pub async fn locate_archive(
    channel: &Arc<dyn RemoteChannel>,
    root: &str,
    explicit: Option<&str>,
) -> StageResult<Option<Archive>> {
    if let Some(name) = explicit.map(str::trim).filter(|n| !n.is_empty()) {
        let archive = archive_from_entry(root, name);
        if channel.exec(&shell::test_dir(&archive.path)).await?.success() {
            return Ok(Some(Archive {
                compressed: false,
                ..archive
            }));
        }
        if channel.exec(&shell::test_file(&archive.tarball())).await?.success() {
            return Ok(Some(Archive {
                compressed: true,
                ..archive
            }));
        }
        return Err(StageError::RemoteState(format!(
            "archive {} not found under {}",
            name, root
        )));
    }

    let listing = channel.exec(&shell::list_dir(root)).await?;
    if !listing.success() {
        return Err(StageError::RemoteState(format!(
            "cannot list {}: {}",
            root,
            listing.stderr.trim()
        )));
    }
    Ok(latest_archive(root, listing.lines()))
}
