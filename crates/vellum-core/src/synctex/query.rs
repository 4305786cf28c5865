//! Lookups in both directions.
//!
//! The closeness score and the page-bottom threshold are tuned by hand
//! against pdfTeX output.

use serde::Serialize;

use super::parser::{PositionBlock, PositionIndex};
use crate::manifest::basename;

/// A block whose top sits below this many big points is taken as content
/// that wrapped onto the next page.
const PAGE_BOTTOM_BP: f64 = 700.0;

/// A place in the sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// A place in the output, in big points from the top-left corner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputLocation {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl PositionIndex {
    /// Source location nearest to a point on an output page.
    ///
    /// Vertical distance counts double, so blocks on the same line of text
    /// win over blocks directly above or below.
    pub fn output_to_source(&self, page: u32, x: f64, y: f64) -> Option<SourceLocation> {
        let h = self.bp_to_h(x);
        let v = self.bp_to_v(y);

        let on_page: Vec<&PositionBlock> = self
            .blocks
            .iter()
            .filter(|block| block.page == page && self.inputs.contains_key(&block.tag))
            .collect();

        let best = on_page
            .iter()
            .copied()
            .filter(|block| block.line > 0)
            .map(|block| {
                let score = 2.0 * (block.v as f64 - v).abs() + (block.h as f64 - h).abs();
                (score, block)
            })
            .filter(|(score, _)| score.is_finite())
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, block)| block)
            .or_else(|| on_page.iter().copied().find(|block| block.line > 0))?;

        Some(SourceLocation {
            file: self.inputs.get(&best.tag)?.clone(),
            line: best.line,
            column: best.column,
        })
    }

    /// Output position of a source line.
    ///
    /// `file` may be a full path, a path suffix or a bare file name. When
    /// the line itself produced no block, the nearest line that did is used.
    pub fn source_to_output(&self, file: &str, line: u32) -> Option<OutputLocation> {
        let tag = self.tag_for(file)?;
        let tagged: Vec<&PositionBlock> = self.blocks.iter().filter(|b| b.tag == tag).collect();

        let mut matches: Vec<&PositionBlock> =
            tagged.iter().copied().filter(|b| b.line == line).collect();
        if matches.is_empty() {
            let nearest = tagged.iter().map(|b| b.line).min_by_key(|l| l.abs_diff(line))?;
            matches = tagged.into_iter().filter(|b| b.line == nearest).collect();
        }
        matches.sort_by_key(|b| (b.page, b.v));

        let first = *matches.first()?;
        let chosen = if self.v_to_bp(first.v) > PAGE_BOTTOM_BP {
            matches
                .iter()
                .copied()
                .find(|b| b.page > first.page)
                .unwrap_or(first)
        } else {
            first
        };
        Some(self.output_location(chosen))
    }

    fn output_location(&self, block: &PositionBlock) -> OutputLocation {
        let scale = self.scale();
        let height = block.height.unwrap_or(0) + block.depth.unwrap_or(0);
        OutputLocation {
            page: block.page,
            x: self.h_to_bp(block.h),
            y: self.v_to_bp(block.v),
            width: block.width.unwrap_or(0) as f64 * scale,
            height: height as f64 * scale,
        }
    }

    /// Input tag of a file: exact path, then path suffix, then file name.
    fn tag_for(&self, file: &str) -> Option<u32> {
        let file = file.trim_start_matches("./");
        let normalized = |path: &str| path.trim_start_matches("./").to_string();

        let exact = self.inputs.iter().find(|(_, path)| normalized(path) == file);
        let suffix = || {
            self.inputs.iter().find(|(_, path)| {
                let path = normalized(path);
                path.ends_with(&format!("/{file}")) || file.ends_with(&format!("/{path}"))
            })
        };
        let name = || {
            let wanted = basename(file);
            self.inputs.iter().find(|(_, path)| basename(path) == wanted)
        };

        exact.or_else(suffix).or_else(name).map(|(tag, _)| *tag)
    }
}
