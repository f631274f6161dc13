//! Content-Length framing for the client side of the adapter.
//!
//! `Content-Length: <n>\r\n\r\n<JSON>`, the framing every DAP client speaks.
//! The engine core does not own the client transport (stdio vs TCP belongs to
//! the front end), it only provides the framed read/write primitives.

use crate::error::Error;
use serde::Serialize;
use std::io::{BufRead, Read, Write};

/// Read a single Content-Length framed payload.
///
/// Unknown headers are skipped; a clean EOF before any header surfaces as
/// [`Error::Disconnected`].
pub fn read_framed<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, Error> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            return Err(Error::Disconnected);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(
                v.trim()
                    .parse()
                    .map_err(|_| Error::MissingContentLength)?,
            );
        }
    }

    let len = content_length.ok_or(Error::MissingContentLength)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a value as a Content-Length framed JSON payload.
pub fn write_framed<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), Error> {
    let payload = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}
