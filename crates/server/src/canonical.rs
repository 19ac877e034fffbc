//! Project path canonicalization.
//!
//! Every spelling of a directory (relative, symlinked, trailing slash, `..`)
//! must map to one key, otherwise two channels get created for one project.

use std::path::{Component, Path, PathBuf};

/// Resolve `raw` to an absolute, symlink-free path string.
///
/// When the path cannot be resolved (deleted, permission denied) the lexically
/// normalized absolute form is returned instead. Never fails.
pub fn canonicalize_project_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let path = Path::new(trimmed);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let resolved = std::fs::canonicalize(&absolute).unwrap_or_else(|_| normalize_lexically(&absolute));
    resolved.to_string_lossy().into_owned()
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        out
    }
}

/// Last path component, used as the default project display name.
pub fn project_display_name(canonical: &str) -> String {
    Path::new(canonical)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| canonical.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spellings_of_one_directory_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = dir.path().join("api");
        std::fs::create_dir(&project).expect("mkdir");
        let link = dir.path().join("api-link");
        std::os::unix::fs::symlink(&project, &link).expect("symlink");

        std::fs::create_dir(project.join("sub")).expect("mkdir sub");

        let direct = canonicalize_project_path(&project.to_string_lossy());
        let trailing = canonicalize_project_path(&format!("{}/", project.display()));
        let dotted = canonicalize_project_path(&format!("{}/./sub/..", project.display()));
        let via_link = canonicalize_project_path(&link.to_string_lossy());

        assert_eq!(direct, trailing);
        assert_eq!(direct, dotted);
        assert_eq!(direct, via_link);
    }

    #[test]
    fn missing_paths_fall_back_to_lexical_form() {
        assert_eq!(
            canonicalize_project_path("/definitely/not/here/../there/./x"),
            "/definitely/not/there/x"
        );
        assert_eq!(
            canonicalize_project_path("/definitely/not/here/"),
            canonicalize_project_path("/definitely/not/here")
        );
    }

    #[test]
    fn display_name_is_last_component() {
        assert_eq!(project_display_name("/home/ana/src/api"), "api");
        assert_eq!(project_display_name("/"), "/");
    }
}
