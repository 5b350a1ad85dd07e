// Directory listing for the log-tree report (Unix focus)
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

/// Nested JSON view of a directory.
///
/// Regular files appear as their name, subdirectories as a single-key object
/// `{name: [...]}`. Symlinks are skipped so a link cannot pull in a tree
/// outside the log directory. Entries are sorted by name. A path that is not
/// a directory yields `null`.
pub fn dir_tree(root: &Path) -> Value {
    if !root.is_dir() {
        warn!(path = %root.display(), "not a directory");
        return Value::Null;
    }
    Value::Array(list_dir(root))
}

fn list_dir(dir: &Path) -> Vec<Value> {
    use walkdir::WalkDir;

    let mut items = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if file_type.is_file() {
            items.push(Value::String(name));
        } else if file_type.is_dir() {
            let mut sub = Map::new();
            sub.insert(name, Value::Array(list_dir(entry.path())));
            items.push(Value::Object(sub));
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_dir_tree_nested() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("b.log"), "x").unwrap();
        fs::write(root.join("a.log"), "x").unwrap();
        fs::create_dir_all(root.join("2024/03")).unwrap();
        fs::write(root.join("2024/03/run.log"), "x").unwrap();
        fs::create_dir(root.join("empty")).unwrap();

        assert_eq!(
            dir_tree(root),
            json!([
                {"2024": [{"03": ["run.log"]}]},
                "a.log",
                "b.log",
                {"empty": []}
            ])
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dir_tree_skips_symlinks() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), "x").unwrap();
        fs::write(tmp.path().join("kept.log"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("dirlink")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("kept.log"), tmp.path().join("filelink")).unwrap();

        assert_eq!(dir_tree(tmp.path()), json!(["kept.log"]));
    }

    #[test]
    fn test_dir_tree_missing_path() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(dir_tree(&tmp.path().join("nope")), Value::Null);
        fs::write(tmp.path().join("file"), "x").unwrap();
        assert_eq!(dir_tree(&tmp.path().join("file")), Value::Null);
    }
}
