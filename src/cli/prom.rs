//! Minimal Prometheus textfile emission for final summaries.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use probkit::Error;

/// Write a single gauge in textfile-collector format to `path`, or to
/// stdout when the path is `-`.
pub(crate) fn write_gauge(path: &Path, name: &str, help: &str, value: u64) -> Result<(), Error> {
    let body = format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n");
    if path.as_os_str() == "-" {
        io::stdout().write_all(body.as_bytes())?;
    } else {
        fs::write(path, body)?;
    }
    Ok(())
}
