//! Data manifest
//!
//! A manifest is a CSV committed to the destination before the data phase
//! of a tree transfer starts. A reader that finds a manifest whose entries
//! are not all present and matching knows the transfer is incomplete or
//! still settling, without trusting the listing alone.

use std::collections::HashMap;

use polystore_core::{StoreError, StoreResult};

/// File name the manifest is committed under, relative to the
/// destination root of the transfer.
pub const MANIFEST_NAME: &str = ".data_manifest.csv";

/// One expected object: `path,size,checksum` with the path relative to
/// the destination root. The checksum may be empty when the source listing
/// carried no content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

pub fn encode(entries: &[ManifestEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.path);
        out.push(',');
        out.push_str(&entry.size.to_string());
        out.push(',');
        out.push_str(&entry.checksum);
        out.push('\n');
    }
    out
}

pub fn parse(raw: &str) -> StoreResult<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        // Paths may themselves contain commas; size and checksum never do.
        let mut fields = line.rsplitn(3, ',');
        let (Some(checksum), Some(size), Some(path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(StoreError::Other(format!("malformed manifest line: {line}")));
        };
        let size = size
            .parse::<u64>()
            .map_err(|_| StoreError::Other(format!("malformed manifest size: {line}")))?;
        entries.push(ManifestEntry {
            path: path.to_string(),
            size,
            checksum: checksum.to_string(),
        });
    }
    Ok(entries)
}

/// Paths whose observed state diverges from the manifest: missing outright,
/// wrong size, or (when both sides carry one) wrong checksum.
pub fn divergent(
    expected: &[ManifestEntry],
    observed: &HashMap<String, (u64, Option<String>)>,
) -> Vec<String> {
    let mut paths = Vec::new();
    for entry in expected {
        match observed.get(&entry.path) {
            None => paths.push(entry.path.clone()),
            Some((size, _)) if *size != entry.size => paths.push(entry.path.clone()),
            Some((_, Some(checksum)))
                if !entry.checksum.is_empty() && checksum != &entry.checksum =>
            {
                paths.push(entry.path.clone())
            }
            Some(_) => {}
        }
    }
    paths
}
