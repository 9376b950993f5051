#[macro_use]
extern crate anyhow;

pub(crate) use anyhow::Result;

pub use analyse::{ShimcacheAnalyser, SrumAnalyser};
pub use file::{Document, Kind as FileKind, Reader, get_files, known_extensions};
pub use hunt::{Detections, Hunter, HunterBuilder};
pub use rule::{
    Filter, Kind as RuleKind, Level as RuleLevel, Status as RuleStatus, lint, load,
};
pub use search::{SearchResult, Searcher, SearcherBuilder};
pub use write::{Format, Writer, set_writer, writer};

#[macro_use]
mod write;

pub mod analyse;
pub mod cli;
pub mod file;
pub mod hunt;
pub mod rule;
pub mod search;
pub mod tau;
pub mod value;
