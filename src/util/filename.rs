//! Database file naming conventions.

use std::path::{Path, PathBuf};

/// Name of the advisory lock file inside a database directory.
pub const LOCK_FILE_NAME: &str = "FLOCK";

/// Extension of data segment files.
pub const SEG_FILE_EXT: &str = ".SEG";

/// Extension of hint file segments.
pub const HINT_FILE_EXT: &str = ".HINT";

/// Extension of the merge-finished marker file.
pub const MERGE_FIN_FILE_EXT: &str = ".MERGEFIN";

/// Suffix appended to the database directory for in-progress merges.
pub const MERGE_DIR_SUFFIX: &str = "-merge";

/// Build a segment file path: nine-digit zero-padded id plus extension.
pub fn segment_file_name(dir: &Path, ext: &str, id: u32) -> PathBuf {
    dir.join(format!("{:09}{}", id, ext))
}

/// Parse a segment id out of a file name with the given extension.
///
/// Returns `None` for files that don't carry the extension or whose
/// stem is not a decimal integer.
pub fn parse_segment_file_name(name: &str, ext: &str) -> Option<u32> {
    name.strip_suffix(ext)?.parse::<u32>().ok()
}

/// Generate the lock file path.
pub fn lock_file_path(db_path: &Path) -> PathBuf {
    db_path.join(LOCK_FILE_NAME)
}

/// Directory holding in-progress merge output for a database directory.
pub fn merge_dir_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(MERGE_DIR_SUFFIX);
    db_path.parent().unwrap_or(Path::new("")).join(name)
}
