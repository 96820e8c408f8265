//! JSON output for CLI
//!
//! Every successful command writes exactly one JSON line to stdout,
//! `{"status":"ok","data":...}`. Errors go to stderr from `main`.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;

use super::errors::CliResult;

/// Write a success response carrying `data` to stdout
pub fn write_response<T: Serialize>(data: &T) -> CliResult<()> {
    write_line(&json!({
        "status": "ok",
        "data": data,
    }))
}

fn write_line(value: &serde_json::Value) -> CliResult<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}
