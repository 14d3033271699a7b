//! In-memory file-tree model.
//!
//! Mirrors the sandbox filesystem for the UI's observable tree. Every node
//! carries its full slash-delimited path (root-relative, no leading slash);
//! the root folder has `name == "root"` and an empty path. Children keep
//! insertion order.

use serde::{Deserialize, Serialize};

/// A node in the virtual file tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileSystemNode {
    File {
        name: String,
        path: String,
        content: String,
        /// Display/parsing hint derived from the file extension.
        language: String,
    },
    Folder {
        name: String,
        path: String,
        children: Vec<FileSystemNode>,
    },
}

impl FileSystemNode {
    /// The empty root folder.
    pub fn root() -> Self {
        FileSystemNode::Folder {
            name: "root".to_string(),
            path: String::new(),
            children: Vec::new(),
        }
    }

    pub fn file(name: &str, path: &str, content: String) -> Self {
        FileSystemNode::File {
            name: name.to_string(),
            path: path.to_string(),
            content,
            language: language_for_path(path).to_string(),
        }
    }

    pub fn folder(name: &str, path: &str, children: Vec<FileSystemNode>) -> Self {
        FileSystemNode::Folder {
            name: name.to_string(),
            path: path.to_string(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FileSystemNode::File { name, .. } | FileSystemNode::Folder { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            FileSystemNode::File { path, .. } | FileSystemNode::Folder { path, .. } => path,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, FileSystemNode::Folder { .. })
    }

    /// Walk the tree segment by segment. A missing segment is `None`, never
    /// an error. The empty path returns the node itself.
    pub fn find(&self, path: &str) -> Option<&FileSystemNode> {
        if path.is_empty() {
            return Some(self);
        }
        let mut current = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let FileSystemNode::Folder { children, .. } = current else {
                return None;
            };
            current = children.iter().find(|c| c.name() == segment)?;
        }
        Some(current)
    }

    /// Insert (or replace) a file at `path`, creating intermediate folders.
    ///
    /// A non-folder node occupying an intermediate segment is replaced by a
    /// folder; a same-name node at the final location is replaced.
    pub fn insert_file(&mut self, path: &str, content: &str) {
        let node = FileSystemNode::file(
            path.rsplit('/').next().unwrap_or(path),
            path,
            content.to_string(),
        );
        self.insert_node(path, node);
    }

    /// Insert an empty folder at `path`, creating intermediate folders.
    /// An existing folder at that path is left untouched.
    pub fn insert_folder(&mut self, path: &str) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = self;
        let mut prefix = String::new();
        for segment in segments {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            current = Self::descend_folder(current, segment, &prefix);
        }
    }

    fn insert_node(&mut self, path: &str, node: FileSystemNode) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut current = self;
        let mut prefix = String::new();
        for segment in parents {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            current = Self::descend_folder(current, segment, &prefix);
        }

        let FileSystemNode::Folder { children, .. } = current else {
            return;
        };
        match children.iter_mut().find(|c| c.name() == *last) {
            Some(existing) => *existing = node,
            None => children.push(node),
        }
    }

    /// Descend into the child folder `segment`, creating it (or replacing a
    /// same-name file) as needed.
    fn descend_folder<'a>(
        node: &'a mut FileSystemNode,
        segment: &str,
        path: &str,
    ) -> &'a mut FileSystemNode {
        let FileSystemNode::Folder { children, .. } = node else {
            unreachable!("descend_folder is only called on folders");
        };
        let position = children.iter().position(|c| c.name() == segment);
        match position {
            Some(index) => {
                if !children[index].is_folder() {
                    children[index] = FileSystemNode::folder(segment, path, Vec::new());
                }
                &mut children[index]
            }
            None => {
                children.push(FileSystemNode::folder(segment, path, Vec::new()));
                children.last_mut().expect("just pushed")
            }
        }
    }

    /// Remove the node at `path`, returning it if present.
    pub fn remove(&mut self, path: &str) -> Option<FileSystemNode> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (last, parents) = segments.split_last()?;

        let mut current = self;
        for segment in parents {
            let FileSystemNode::Folder { children, .. } = current else {
                return None;
            };
            current = children.iter_mut().find(|c| c.name() == *segment)?;
        }
        let FileSystemNode::Folder { children, .. } = current else {
            return None;
        };
        let index = children.iter().position(|c| c.name() == *last)?;
        Some(children.remove(index))
    }

    /// Update the content of the file at `path`, if present.
    pub fn update_content(&mut self, path: &str, new_content: &str) -> bool {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = self;
        for segment in &segments {
            let FileSystemNode::Folder { children, .. } = current else {
                return false;
            };
            let Some(next) = children.iter_mut().find(|c| c.name() == *segment) else {
                return false;
            };
            current = next;
        }
        if let FileSystemNode::File { content, .. } = current {
            *content = new_content.to_string();
            true
        } else {
            false
        }
    }

    /// Case-insensitive substring search over file names and contents.
    /// Returns deep copies of matching file nodes only.
    pub fn search(&self, query: &str) -> Vec<FileSystemNode> {
        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        self.collect_matches(&needle, &mut matches);
        matches
    }

    fn collect_matches(&self, needle: &str, matches: &mut Vec<FileSystemNode>) {
        match self {
            FileSystemNode::File { name, content, .. } => {
                if name.to_lowercase().contains(needle)
                    || content.to_lowercase().contains(needle)
                {
                    matches.push(self.clone());
                }
            }
            FileSystemNode::Folder { children, .. } => {
                for child in children {
                    child.collect_matches(needle, matches);
                }
            }
        }
    }

    /// Flatten into mount order: every folder path (parents first), then
    /// every file with its content. Used to mount a template tree.
    pub fn mount_plan(&self) -> (Vec<String>, Vec<(String, String)>) {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        self.collect_mount(&mut dirs, &mut files);
        (dirs, files)
    }

    fn collect_mount(&self, dirs: &mut Vec<String>, files: &mut Vec<(String, String)>) {
        match self {
            FileSystemNode::File { path, content, .. } => {
                files.push((path.clone(), content.clone()));
            }
            FileSystemNode::Folder { path, children, .. } => {
                if !path.is_empty() {
                    dirs.push(path.clone());
                }
                for child in children {
                    child.collect_mount(dirs, files);
                }
            }
        }
    }

    /// Total number of file nodes in the tree.
    pub fn file_count(&self) -> usize {
        match self {
            FileSystemNode::File { .. } => 1,
            FileSystemNode::Folder { children, .. } => {
                children.iter().map(|c| c.file_count()).sum()
            }
        }
    }
}

/// Display language hint for a path, from its extension.
pub fn language_for_path(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or("");
    match extension {
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "css" => "css",
        "scss" | "sass" => "scss",
        "html" | "htm" => "html",
        "json" => "json",
        "md" => "markdown",
        "py" => "python",
        "rs" => "rust",
        "sh" | "bash" => "shell",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "svg" | "xml" => "xml",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_invariants() {
        let root = FileSystemNode::root();
        assert_eq!(root.name(), "root");
        assert_eq!(root.path(), "");
        assert!(root.is_folder());
    }

    #[test]
    fn test_insert_file_creates_intermediate_folders() {
        let mut root = FileSystemNode::root();
        root.insert_file("app/components/Button.tsx", "export {}");

        let app = root.find("app").unwrap();
        assert!(app.is_folder());
        assert_eq!(app.path(), "app");

        let file = root.find("app/components/Button.tsx").unwrap();
        assert_eq!(file.name(), "Button.tsx");
        match file {
            FileSystemNode::File { content, language, .. } => {
                assert_eq!(content, "export {}");
                assert_eq!(language, "typescript");
            }
            _ => panic!("expected a file"),
        }
    }

    #[test]
    fn test_insert_replaces_same_name_sibling() {
        let mut root = FileSystemNode::root();
        root.insert_file("index.html", "<p>one</p>");
        root.insert_file("index.html", "<p>two</p>");

        let FileSystemNode::Folder { children, .. } = &root else {
            unreachable!()
        };
        assert_eq!(children.len(), 1);
        match root.find("index.html").unwrap() {
            FileSystemNode::File { content, .. } => assert_eq!(content, "<p>two</p>"),
            _ => panic!("expected a file"),
        }
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let mut root = FileSystemNode::root();
        root.insert_file("zeta.txt", "");
        root.insert_file("alpha.txt", "");
        let FileSystemNode::Folder { children, .. } = &root else {
            unreachable!()
        };
        let names: Vec<_> = children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["zeta.txt", "alpha.txt"]);
    }

    #[test]
    fn test_find_missing_returns_none() {
        let root = FileSystemNode::root();
        assert!(root.find("no/such/file.txt").is_none());
        assert!(root.find("missing").is_none());
    }

    #[test]
    fn test_remove_prunes_node() {
        let mut root = FileSystemNode::root();
        root.insert_file("a/b/c.txt", "x");
        assert!(root.remove("a/b/c.txt").is_some());
        assert!(root.find("a/b/c.txt").is_none());
        // parent folders remain
        assert!(root.find("a/b").is_some());
        // removing again is a no-op
        assert!(root.remove("a/b/c.txt").is_none());
    }

    #[test]
    fn test_update_content_only_touches_files() {
        let mut root = FileSystemNode::root();
        root.insert_file("notes.md", "old");
        assert!(root.update_content("notes.md", "new"));
        assert!(!root.update_content("missing.md", "new"));
        root.insert_folder("dir");
        assert!(!root.update_content("dir", "new"));
    }

    #[test]
    fn test_search_matches_name_and_content() {
        let mut root = FileSystemNode::root();
        root.insert_file("src/Header.tsx", "export const Header = () => null");
        root.insert_file("src/util.ts", "export function formatDate() {}");
        root.insert_file("README.md", "A sample project");

        let by_name = root.search("header");
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].path(), "src/Header.tsx");

        let by_content = root.search("FORMATDATE");
        assert_eq!(by_content.len(), 1);
        assert_eq!(by_content[0].path(), "src/util.ts");

        assert!(root.search("nonexistent").is_empty());
    }

    #[test]
    fn test_mount_plan_orders_parents_first() {
        let mut root = FileSystemNode::root();
        root.insert_file("a/b/one.txt", "1");
        root.insert_file("a/two.txt", "2");
        let (dirs, files) = root.mount_plan();
        assert_eq!(dirs, vec!["a", "a/b"]);
        assert_eq!(
            files,
            vec![
                ("a/b/one.txt".to_string(), "1".to_string()),
                ("a/two.txt".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_language_inference() {
        assert_eq!(language_for_path("app/page.tsx"), "typescript");
        assert_eq!(language_for_path("style.css"), "css");
        assert_eq!(language_for_path("Dockerfile"), "plaintext");
    }
}
