//! CLI domain: parse, route, output, and presentation only.
//! No capture logic; the route table dispatches to the capture entry point.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, OutputFormat};
pub use presentation::{format_capture_json, format_capture_text};
pub use route::RunContext;
