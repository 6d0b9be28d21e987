//! ZIP packing of container exports.

use std::collections::HashSet;
use std::io::{Cursor, Write};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use driveline_common::{Error, Result};

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Serialization(format!("ZIP archive: {}", e))
}

/// Pack named blobs into an in-memory deflated ZIP archive.
///
/// Entries whose name was already written are skipped.
pub fn write_zip<I, B>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (String, B)>,
    B: AsRef<[u8]>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut seen = HashSet::new();

    for (name, data) in entries {
        if !seen.insert(name.clone()) {
            warn!(name = %name, "Skipping duplicate archive entry");
            continue;
        }
        writer.start_file(name, options).map_err(zip_err)?;
        writer.write_all(data.as_ref())?;
    }

    let cursor = writer.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}
