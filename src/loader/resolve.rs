use std::path::{Path, PathBuf};
use tracing::warn;

/// Outcome of resolving a configured input path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    /// Set when a scanned file replaced the configured one.
    pub notice: Option<String>,
}

impl Resolved {
    fn configured(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            notice: None,
        }
    }
}

/// Use `configured` if it exists; otherwise the first regular file in `dir`
/// whose name ends in `.extension` (ASCII case-insensitive), in directory
/// enumeration order. Without a match the configured path is returned
/// unchanged so that loading it fails with the original name.
pub fn resolve(configured: &Path, extension: &str, dir: &Path) -> Resolved {
    if configured.exists() {
        return Resolved::configured(configured);
    }

    match scan(dir, extension) {
        Some(found) => {
            let notice = format!(
                "'{}' not found, using '{}' instead",
                configured.display(),
                found.display()
            );
            warn!(configured = %configured.display(), found = %found.display(), "Falling back to scanned file");
            Resolved {
                path: found,
                notice: Some(notice),
            }
        }
        None => Resolved::configured(configured),
    }
}

fn scan(dir: &Path, extension: &str) -> Option<PathBuf> {
    let suffix = format!(".{}", extension.trim_start_matches('.').to_ascii_lowercase());
    let entries = std::fs::read_dir(dir).ok()?;

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .to_ascii_lowercase()
                .ends_with(&suffix)
        })
        .map(|entry| {
            // keep paths relative when scanning the working directory
            if dir == Path::new(".") {
                PathBuf::from(entry.file_name())
            } else {
                entry.path()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_existing_path_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("trained_model.safetensors");
        fs::write(&model, b"x").unwrap();
        fs::write(dir.path().join("other.safetensors"), b"x").unwrap();

        let resolved = resolve(&model, "safetensors", dir.path());
        assert_eq!(resolved, Resolved::configured(&model));
    }

    #[test]
    fn test_single_match_is_substituted_with_notice() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plants.safetensors"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let configured = dir.path().join("trained_model.safetensors");
        let resolved = resolve(&configured, "safetensors", dir.path());

        assert_eq!(resolved.path, dir.path().join("plants.safetensors"));
        let notice = resolved.notice.unwrap();
        assert!(notice.contains("trained_model.safetensors"));
        assert!(notice.contains("plants.safetensors"));
    }

    #[test]
    fn test_extension_match_ignores_case() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("LABELS.TXT"), b"a\n").unwrap();

        let resolved = resolve(&dir.path().join("class_names.txt"), ".txt", dir.path());
        assert_eq!(resolved.path, dir.path().join("LABELS.TXT"));
    }

    #[test]
    fn test_directories_and_partial_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("backup.safetensors")).unwrap();
        fs::write(dir.path().join("model.safetensors.bak"), b"x").unwrap();
        fs::write(dir.path().join("safetensors"), b"x").unwrap();

        let configured = dir.path().join("trained_model.safetensors");
        let resolved = resolve(&configured, "safetensors", dir.path());
        assert_eq!(resolved, Resolved::configured(&configured));
    }

    #[test]
    fn test_unreadable_directory_keeps_configured_path() {
        let configured = Path::new("trained_model.safetensors");
        let resolved = resolve(configured, "safetensors", Path::new("no/such/dir"));
        assert_eq!(resolved.path, configured);
        assert!(resolved.notice.is_none());
    }
}
