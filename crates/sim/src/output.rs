// Report rendering: text on a terminal, JSON when piped or with `--json`.

use std::io::{self, IsTerminal, Write};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn detect(json_flag: bool) -> Self {
        if json_flag || !io::stdout().is_terminal() {
            Self::Json
        } else {
            Self::Human
        }
    }
}

pub fn print_report<T, F>(format: OutputFormat, report: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_report(&mut io::stdout().lock(), format, report, human_fn)
}

pub fn write_report<W, T, F>(writer: &mut W, format: OutputFormat, report: &T, human_fn: F) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(report)),
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, report).map_err(io::Error::other)?;
            writeln!(writer)
        }
    }
}
