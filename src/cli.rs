//! CLI domain: parse, route and output only.
//! No orchestration here; handlers drive `GenerationOrchestrator` and format results.

mod output;
mod parse;
mod route;

pub use output::{
    format_catalog_json, format_catalog_text, format_progress_line, format_session_json,
    format_session_text, map_error,
};
pub use parse::{Cli, Commands, ModeArg};
pub use route::RunContext;
