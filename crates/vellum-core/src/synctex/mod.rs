//! SyncTeX position logs: parsing and source ⇄ output lookup.
//!
//! The log is line-oriented text, optionally gzip-compressed. A short
//! header gives the scale (`Unit`, `Magnification`, offsets), `Input:` lines
//! map numeric tags to source paths, and each content line records one box,
//! kern, glue or math node under the most recent `{page` marker:
//!
//! ```text
//! Input:1:/work/main.tex
//! {1
//! (1,12:4736286,3998044:30785863,655360,0
//!  │  │       │       │           └ width, height, depth
//!  │  │       │       └ v
//!  │  │       └ h
//!  │  └ line
//!  └ tag
//! ```

mod parser;
mod query;

pub use parser::{BlockKind, PositionBlock, PositionIndex};
pub use query::{OutputLocation, SourceLocation};
