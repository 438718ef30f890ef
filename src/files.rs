//! The project tree mounted into a sandbox.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::DevResult;

const TUTORIAL_INDEX_JS: &str = include_str!("../project/index.js");
const TUTORIAL_PACKAGE_JSON: &str = include_str!("../project/package.json");

/// Directories never copied from disk into a mounted tree.
const SKIPPED_DIRS: [&str; 2] = ["node_modules", "target"];

/// A single entry of a [`FileTree`].
///
/// Serialized the same way browser sandboxes describe a tree:
/// `{"file": {"contents": "..."}}` or `{"directory": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNode {
    File { contents: String },
    Directory(FileTree),
}

/// Mapping from entry name to file or directory, provided once at mount time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileTree(BTreeMap<String, FileNode>);

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in toy project: an Express app and its `package.json`.
    pub fn tutorial() -> Self {
        let mut tree = Self::new();
        tree.insert_file("index.js", TUTORIAL_INDEX_JS);
        tree.insert_file("package.json", TUTORIAL_PACKAGE_JSON);
        tree
    }

    /// Load a tree from a directory on disk, skipping hidden entries,
    /// dependency folders and files that are not valid UTF-8.
    pub fn from_dir(dir: &Path) -> DevResult<Self> {
        let mut tree = Self::new();
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                tree.0
                    .insert(name, FileNode::Directory(Self::from_dir(&path)?));
            } else if file_type.is_file() {
                match String::from_utf8(fs::read(&path)?) {
                    Ok(contents) => tree.insert_file(name, contents),
                    Err(_) => warn!(path = %path.display(), "Skipping non UTF-8 file"),
                }
            }
        }

        debug!(dir = %dir.display(), entries = tree.0.len(), "Loaded project tree");
        Ok(tree)
    }

    pub fn insert_file(&mut self, name: impl Into<String>, contents: impl Into<String>) {
        self.0.insert(
            name.into(),
            FileNode::File {
                contents: contents.into(),
            },
        );
    }

    pub fn insert_dir(&mut self, name: impl Into<String>, tree: FileTree) {
        self.0.insert(name.into(), FileNode::Directory(tree));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a file's contents by slash-separated path.
    pub fn file(&self, path: &str) -> Option<&str> {
        let mut parts = path.trim_start_matches('/').split('/').peekable();
        let mut tree = self;
        while let Some(part) = parts.next() {
            match (tree.0.get(part)?, parts.peek()) {
                (FileNode::File { contents }, None) => return Some(contents),
                (FileNode::Directory(sub), Some(_)) => tree = sub,
                _ => return None,
            }
        }
        None
    }

    /// Every file as a `(relative path, contents)` pair, in path order.
    pub fn flatten(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        self.flatten_into("", &mut out);
        out
    }

    fn flatten_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a str)>) {
        for (name, node) in &self.0 {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            match node {
                FileNode::File { contents } => out.push((path, contents)),
                FileNode::Directory(sub) => sub.flatten_into(&path, out),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tutorial_tree_has_entry_point() {
        let tree = FileTree::tutorial();
        assert!(tree.file("/index.js").unwrap().contains("express"));
        assert!(tree.file("package.json").unwrap().contains("\"start\""));
    }

    #[test]
    fn nested_lookup_and_flatten() {
        let mut src = FileTree::new();
        src.insert_file("main.js", "console.log(1)");
        let mut tree = FileTree::new();
        tree.insert_dir("src", src);
        tree.insert_file("a.txt", "a");

        assert_eq!(tree.file("src/main.js"), Some("console.log(1)"));
        assert_eq!(tree.file("src"), None);
        assert_eq!(tree.file("src/main.js/x"), None);

        let flat = tree.flatten();
        assert_eq!(
            flat,
            vec![
                ("a.txt".to_string(), "a"),
                ("src/main.js".to_string(), "console.log(1)")
            ]
        );
    }

    #[test]
    fn serializes_like_a_browser_tree() {
        let mut tree = FileTree::new();
        tree.insert_file("index.js", "x");
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"index.js": {"file": {"contents": "x"}}})
        );
        let back: FileTree = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn from_dir_skips_hidden_and_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "hi").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/express")).unwrap();
        fs::write(dir.path().join("node_modules/express/index.js"), "").unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/util.js"), "u").unwrap();

        let tree = FileTree::from_dir(dir.path()).unwrap();
        let paths: Vec<String> = tree.flatten().into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec!["index.js", "lib/util.js"]);
    }
}
