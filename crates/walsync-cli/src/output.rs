use std::io::Write;

use walsync_core::Change;

/// Write one change as a single JSON line.
pub fn write_change(out: &mut impl Write, change: &Change) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, change)?;
    out.write_all(b"\n")
}
