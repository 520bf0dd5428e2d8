//! Source directory scanning.

use std::path::Path;

use tracing::warn;

use crate::error::UploadError;
use crate::types::SourceFile;

/// Lists the regular files directly inside `dir`, sorted by name.
///
/// Subdirectories, dangling symlinks and names that are not valid UTF-8
/// are skipped with a warning.
pub fn scan_source_dir(dir: &Path) -> Result<Vec<SourceFile>, UploadError> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !metadata.is_file() {
            warn!(path = %path.display(), "skipping entry that is not a regular file");
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %path.display(), "skipping file with non UTF-8 name");
            continue;
        };

        files.push(SourceFile {
            name,
            path,
            size: metadata.len(),
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
