//! Cross-reference convergence checks.

use std::collections::BTreeMap;

use crate::vfs::Blob;

/// Auxiliary file extensions carried between passes, in hashing order.
pub const AUX_EXTENSIONS: &[&str] = &["aux", "toc", "lof", "lot", "out"];

const RERUN_MARKERS: &[&str] = &[
    "Rerun to get",
    "Label(s) may have changed",
    "Please rerun LaTeX",
    "Rerun LaTeX",
    "There were undefined references",
    "Table widths have changed",
    "Please (re)run",
];

/// Whether the log asks for another pass.
pub fn suggests_rerun(log: &str) -> bool {
    RERUN_MARKERS.iter().any(|marker| log.contains(marker))
}

fn djb2(bytes: &[u8]) -> u32 {
    bytes.iter().fold(5381u32, |hash, &b| {
        hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(u32::from(b))
    })
}

/// Hash of the auxiliary files, keyed by file name (`main.aux`, ...).
///
/// DJB2 per extension, XORed together with the extension's position mixed
/// in, so swapped contents between two files change the hash.
pub fn aux_hash(files: &BTreeMap<String, Blob>, job: &str) -> u32 {
    AUX_EXTENSIONS
        .iter()
        .enumerate()
        .fold(0, |acc, (position, ext)| {
            let name = format!("{job}.{ext}");
            match files.get(&name) {
                Some(bytes) => acc ^ djb2(bytes).rotate_left(position as u32),
                None => acc,
            }
        })
}
