//! Source ⇄ output lookups on a position log file.

use std::path::Path;

use anyhow::Context;
use vellum_core::PositionIndex;

fn load(path: &Path) -> anyhow::Result<PositionIndex> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(PositionIndex::parse(&bytes)?)
}

/// Print the output position of `file:line` as JSON.
pub fn view(position_log: &Path, file: &str, line: u32) -> anyhow::Result<()> {
    let index = load(position_log)?;
    let location = index
        .source_to_output(file, line)
        .with_context(|| format!("no output recorded for {file}:{line}"))?;
    println!("{}", serde_json::to_string(&location)?);
    Ok(())
}

/// Print the source location under a point of an output page as JSON.
pub fn edit(position_log: &Path, page: u32, x: f64, y: f64) -> anyhow::Result<()> {
    let index = load(position_log)?;
    let location = index
        .output_to_source(page, x, y)
        .with_context(|| format!("nothing recorded on page {page}"))?;
    println!("{}", serde_json::to_string(&location)?);
    Ok(())
}
