//! Position log parsing.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{Error, Result};

/// Scaled points per big point (PDF unit): 65536 × 72.27 / 72.
pub(super) const SP_PER_BP: f64 = 65781.76;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Record type, from the first character of a content line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// `[` vertical box.
    VBox,
    /// `(` horizontal box.
    HBox,
    /// `v` void vertical box.
    VoidVBox,
    /// `h` void horizontal box.
    VoidHBox,
    /// `x` current position.
    Current,
    /// `k` kern.
    Kern,
    /// `g` glue.
    Glue,
    /// `$` math node.
    Math,
}

impl BlockKind {
    fn from_marker(marker: char) -> Option<Self> {
        Some(match marker {
            '[' => Self::VBox,
            '(' => Self::HBox,
            'v' => Self::VoidVBox,
            'h' => Self::VoidHBox,
            'x' => Self::Current,
            'k' => Self::Kern,
            'g' => Self::Glue,
            '$' => Self::Math,
            _ => return None,
        })
    }
}

/// One content record. Coordinates are in log units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionBlock {
    pub kind: BlockKind,
    /// 1-based output page.
    pub page: u32,
    /// Input tag, see [`PositionIndex::input`].
    pub tag: u32,
    pub line: u32,
    pub column: Option<u32>,
    pub h: i64,
    pub v: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub depth: Option<i64>,
}

/// Parsed position log.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionIndex {
    pub(super) unit: f64,
    pub(super) magnification: f64,
    pub(super) x_offset: f64,
    pub(super) y_offset: f64,
    pub(super) inputs: BTreeMap<u32, String>,
    pub(super) blocks: Vec<PositionBlock>,
    pub(super) skipped: usize,
}

impl Default for PositionIndex {
    fn default() -> Self {
        Self {
            unit: 1.0,
            magnification: 1000.0,
            x_offset: 0.0,
            y_offset: 0.0,
            inputs: BTreeMap::new(),
            blocks: Vec::new(),
            skipped: 0,
        }
    }
}

impl PositionIndex {
    /// Parse a position log, gzip-compressed or plain.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut text = String::new();
            GzDecoder::new(bytes)
                .read_to_string(&mut text)
                .map_err(|e| Error::PositionLog(format!("failed to decompress: {e}")))?;
            Self::parse_text(&text)
        } else {
            Self::parse_text(&String::from_utf8_lossy(bytes))
        }
    }

    /// Parse the uncompressed text form.
    pub fn parse_text(text: &str) -> Result<Self> {
        let mut index = Self::default();
        let mut saw_header = false;
        let mut page = 0u32;

        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("SyncTeX Version:") {
                saw_header = !rest.trim().is_empty();
            } else if let Some(rest) = line.strip_prefix("Input:") {
                if let Some((tag, path)) = rest.split_once(':') {
                    match tag.parse() {
                        Ok(tag) => {
                            index.inputs.insert(tag, path.to_string());
                        }
                        Err(_) => index.skipped += 1,
                    }
                }
            } else if let Some(rest) = line.strip_prefix("Unit:") {
                index.unit = header_number(rest, "Unit")?;
            } else if let Some(rest) = line.strip_prefix("Magnification:") {
                index.magnification = header_number(rest, "Magnification")?;
            } else if let Some(rest) = line.strip_prefix("X Offset:") {
                index.x_offset = header_number(rest, "X Offset")?;
            } else if let Some(rest) = line.strip_prefix("Y Offset:") {
                index.y_offset = header_number(rest, "Y Offset")?;
            } else if let Some(rest) = line.strip_prefix('{') {
                match rest.trim().parse() {
                    Ok(number) => page = number,
                    Err(_) => index.skipped += 1,
                }
            } else if let Some(marker) = line.chars().next() {
                let Some(kind) = BlockKind::from_marker(marker) else {
                    continue;
                };
                match parse_record(kind, page, &line[marker.len_utf8()..]) {
                    Some(block) => index.blocks.push(block),
                    None => index.skipped += 1,
                }
            }
        }

        if !saw_header {
            return Err(Error::PositionLog("missing SyncTeX header".into()));
        }
        if index.unit <= 0.0 || index.magnification <= 0.0 {
            return Err(Error::PositionLog(format!(
                "invalid scale (unit {}, magnification {})",
                index.unit, index.magnification
            )));
        }
        debug!(
            inputs = index.inputs.len(),
            blocks = index.blocks.len(),
            skipped = index.skipped,
            "position log parsed"
        );
        Ok(index)
    }

    /// Path of an input tag.
    pub fn input(&self, tag: u32) -> Option<&str> {
        self.inputs.get(&tag).map(String::as_str)
    }

    /// The input table, tag → path.
    pub fn inputs(&self) -> &BTreeMap<u32, String> {
        &self.inputs
    }

    /// All content records in log order.
    pub fn blocks(&self) -> &[PositionBlock] {
        &self.blocks
    }

    /// Malformed records dropped while parsing.
    pub fn skipped_records(&self) -> usize {
        self.skipped
    }

    /// Big points per log unit.
    pub fn scale(&self) -> f64 {
        self.unit * self.magnification / 1000.0 / SP_PER_BP
    }

    /// Horizontal log position to big points.
    pub(super) fn h_to_bp(&self, h: i64) -> f64 {
        (h as f64 * self.unit + self.x_offset) * self.magnification / 1000.0 / SP_PER_BP
    }

    /// Vertical log position to big points.
    pub(super) fn v_to_bp(&self, v: i64) -> f64 {
        (v as f64 * self.unit + self.y_offset) * self.magnification / 1000.0 / SP_PER_BP
    }

    /// Big points to a horizontal log position.
    pub(super) fn bp_to_h(&self, x: f64) -> f64 {
        (x * SP_PER_BP * 1000.0 / self.magnification - self.x_offset) / self.unit
    }

    /// Big points to a vertical log position.
    pub(super) fn bp_to_v(&self, y: f64) -> f64 {
        (y * SP_PER_BP * 1000.0 / self.magnification - self.y_offset) / self.unit
    }
}

fn header_number(value: &str, field: &str) -> Result<f64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::PositionLog(format!("bad {field} value '{}'", value.trim())))
}

/// `tag,line[,column]:h,v[:width[,height,depth]]`
fn parse_record(kind: BlockKind, page: u32, body: &str) -> Option<PositionBlock> {
    let mut parts = body.split(':');
    let mut location = parts.next()?.split(',');
    let tag = location.next()?.parse().ok()?;
    let line = location.next()?.parse().ok()?;
    let column = location.next().and_then(|c| c.parse::<i64>().ok()).and_then(|c| u32::try_from(c).ok());

    let mut position = parts.next()?.split(',');
    let h = position.next()?.parse().ok()?;
    let v = position.next()?.parse().ok()?;

    let mut size = parts
        .next()
        .into_iter()
        .flat_map(|s| s.split(','))
        .map(|n| n.parse::<i64>().ok());
    let width = size.next().flatten();
    let height = size.next().flatten();
    let depth = size.next().flatten();

    Some(PositionBlock {
        kind,
        page,
        tag,
        line,
        column,
        h,
        v,
        width,
        height,
        depth,
    })
}
