//! Standard stream plumbing for `-` locations.

use std::fs::File;
use std::io::{BufReader, BufWriter, IsTerminal, Read, Write};

use rowpipe_core::error::{PipeError, Result};

/// Open a location for reading; `-` is standard input.
pub fn open_input(location: &str) -> Result<Box<dyn Read + Send>> {
    if location == "-" {
        return Ok(Box::new(std::io::stdin()));
    }
    let file = File::open(location).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipeError::NotFound(format!("no such file: {location}")),
        std::io::ErrorKind::PermissionDenied => PipeError::PermissionDenied(location.to_string()),
        _ => PipeError::Transient(format!("cannot open {location}: {e}")),
    })?;
    Ok(Box::new(BufReader::new(file)))
}

/// Open a location for writing; `-` is standard output. Binary formats must
/// pass `binary = true`, which refuses to stream into an interactive
/// terminal.
pub fn open_output(location: &str, binary: bool) -> Result<Box<dyn Write + Send>> {
    if location == "-" {
        if binary && std::io::stdout().is_terminal() {
            return Err(PipeError::InvalidArgument(
                "refusing to write binary output to a terminal; redirect stdout or name a file"
                    .into(),
            ));
        }
        return Ok(Box::new(std::io::stdout()));
    }
    let file = File::create(location).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => PipeError::PermissionDenied(location.to_string()),
        _ => PipeError::Transient(format!("cannot create {location}: {e}")),
    })?;
    Ok(Box::new(BufWriter::new(file)))
}
