use std::path::{Path, PathBuf};

/// Map an opaque project key to its working directory under `root`.
///
/// The key is sanitized to a flat directory name so a hostile key can never
/// escape the workspace root. The directory itself is created later, by the
/// launcher, so that session creation fails atomically if it cannot be made.
pub fn resolve(root: &Path, project: &str) -> PathBuf {
    root.join(sanitize(project))
}

/// Reduce a project key to a safe directory name: alphanumerics, hyphens,
/// underscores and dots pass through, everything else becomes `_`. Leading
/// dots are replaced too, so `..` cannot appear.
fn sanitize(project: &str) -> String {
    let mut name: String = project
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    while name.starts_with('.') {
        name.replace_range(0..1, "_");
    }
    if name.is_empty() {
        name.push('_');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_keys_map_to_subdirectories() {
        let root = Path::new("/srv/work");
        assert_eq!(resolve(root, "proj-1"), PathBuf::from("/srv/work/proj-1"));
        assert_eq!(resolve(root, "a.b_c"), PathBuf::from("/srv/work/a.b_c"));
    }

    #[test]
    fn separators_and_traversal_are_neutralized() {
        let root = Path::new("/srv/work");
        assert_eq!(resolve(root, "../etc"), PathBuf::from("/srv/work/_._etc"));
        assert_eq!(resolve(root, "a/b/c"), PathBuf::from("/srv/work/a_b_c"));
        assert_eq!(resolve(root, "/abs"), PathBuf::from("/srv/work/_abs"));
    }

    #[test]
    fn empty_key_still_yields_a_name() {
        let root = Path::new("/srv/work");
        assert_eq!(resolve(root, ""), PathBuf::from("/srv/work/_"));
    }

    #[test]
    fn hidden_dir_names_are_rejected() {
        let root = Path::new("/srv/work");
        assert_eq!(resolve(root, ".git"), PathBuf::from("/srv/work/_git"));
    }
}
