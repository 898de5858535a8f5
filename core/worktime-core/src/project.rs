//! Project detection for activity attribution.
//!
//! Walks up from a working directory to the nearest level carrying a project
//! marker (`.git`, a manifest, a build file, a web entry point). The detector
//! never fails: with no marker in range, the working directory itself (or its
//! parent, when the directory has a generic name like `src`) becomes the root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Maximum number of levels to walk up before giving up.
pub const MAX_DETECT_DEPTH: usize = 20;

const VCS_MARKER: &str = ".git";
const TYPESCRIPT_MARKER: &str = "tsconfig.json";

/// Typed markers in priority order. The first one present at a level decides
/// the project type.
pub const TYPE_MARKERS: &[(&str, ProjectType)] = &[
    ("go.mod", ProjectType::Go),
    ("Cargo.toml", ProjectType::Rust),
    ("package.json", ProjectType::JavaScript),
    ("pyproject.toml", ProjectType::Python),
    ("setup.py", ProjectType::Python),
    ("requirements.txt", ProjectType::Python),
    ("pom.xml", ProjectType::Java),
    ("build.gradle", ProjectType::Java),
    ("build.gradle.kts", ProjectType::Java),
    ("CMakeLists.txt", ProjectType::Cpp),
    ("Makefile", ProjectType::General),
    ("index.html", ProjectType::Web),
    ("webpack.config.js", ProjectType::Web),
    ("vite.config.js", ProjectType::Web),
    ("vite.config.ts", ProjectType::Web),
    ("next.config.js", ProjectType::Web),
];

/// Directory names too generic to be a project name on their own.
pub const GENERIC_DIR_NAMES: &[&str] = &[
    "src",
    "lib",
    "app",
    "code",
    "work",
    "projects",
    "dev",
    "tmp",
    "test",
    "tests",
    "client",
    "server",
    "frontend",
    "backend",
    "api",
    "web",
    "scripts",
    "tools",
    "bin",
    "build",
    "dist",
    "out",
    "target",
    "node_modules",
    ".git",
    "vendor",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    #[default]
    General,
    Go,
    Rust,
    #[serde(rename = "javascript")]
    JavaScript,
    #[serde(rename = "typescript")]
    TypeScript,
    Python,
    Java,
    Cpp,
    Web,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::General => "general",
            ProjectType::Go => "go",
            ProjectType::Rust => "rust",
            ProjectType::JavaScript => "javascript",
            ProjectType::TypeScript => "typescript",
            ProjectType::Python => "python",
            ProjectType::Java => "java",
            ProjectType::Cpp => "cpp",
            ProjectType::Web => "web",
        }
    }

    /// Lenient parse; anything unrecognized is `General`.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "go" => ProjectType::Go,
            "rust" => ProjectType::Rust,
            "javascript" => ProjectType::JavaScript,
            "typescript" => ProjectType::TypeScript,
            "python" => ProjectType::Python,
            "java" => ProjectType::Java,
            "cpp" => ProjectType::Cpp,
            "web" => ProjectType::Web,
            _ => ProjectType::General,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: String,
    /// Canonical, absolute, no trailing separator.
    pub path: PathBuf,
    pub project_type: ProjectType,
    pub git_branch: Option<String>,
}

impl ProjectInfo {
    pub fn path_string(&self) -> String {
        path_to_string(&self.path)
    }

    pub fn id(&self) -> String {
        project_id(&self.path_string())
    }
}

/// Stable project id: lowercase hex MD5 of the normalized path.
pub fn project_id(normalized_path: &str) -> String {
    format!("{:x}", md5::compute(normalized_path))
}

#[derive(Debug, Clone)]
pub struct ProjectDetector {
    name_overrides: BTreeMap<PathBuf, String>,
    home: Option<PathBuf>,
}

impl Default for ProjectDetector {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

impl ProjectDetector {
    /// `overrides` maps a project path to a display name. Keys are
    /// normalized the same way detected roots are.
    pub fn new(overrides: &BTreeMap<String, String>) -> Self {
        let name_overrides = overrides
            .iter()
            .map(|(path, name)| (normalize_path(Path::new(path)), name.clone()))
            .collect();
        Self {
            name_overrides,
            home: dirs::home_dir().map(|home| normalize_path(&home)),
        }
    }

    /// Replaces the directory the upward walk stops at.
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home.map(|home| normalize_path(&home));
        self
    }

    pub fn detect(&self, start_dir: &Path) -> ProjectInfo {
        let start = normalize_path(&absolute(start_dir));
        let root = self
            .find_marked_root(&start)
            .unwrap_or_else(|| unmarked_root(&start));

        let project_type = detect_type(&root);
        let git_branch = read_git_branch(&root);
        let name = self
            .name_overrides
            .get(&root)
            .cloned()
            .unwrap_or_else(|| base_name(&root));

        ProjectInfo {
            name,
            path: root,
            project_type,
            git_branch,
        }
    }

    fn find_marked_root(&self, start: &Path) -> Option<PathBuf> {
        let mut current = Some(start);
        let mut depth = 0;

        while let Some(dir) = current {
            if depth >= MAX_DETECT_DEPTH {
                break;
            }

            if has_any_marker(dir) {
                return Some(dir.to_path_buf());
            }

            if self.home.as_deref() == Some(dir) {
                break;
            }

            current = dir.parent();
            depth += 1;
        }

        None
    }
}

fn has_any_marker(dir: &Path) -> bool {
    dir.join(VCS_MARKER).exists()
        || TYPE_MARKERS
            .iter()
            .any(|(marker, _)| dir.join(marker).exists())
}

fn detect_type(root: &Path) -> ProjectType {
    for (marker, project_type) in TYPE_MARKERS {
        if root.join(marker).exists() {
            if *project_type == ProjectType::JavaScript && root.join(TYPESCRIPT_MARKER).exists() {
                return ProjectType::TypeScript;
            }
            return *project_type;
        }
    }
    ProjectType::General
}

fn unmarked_root(start: &Path) -> PathBuf {
    if is_generic_name(start) {
        if let Some(parent) = start.parent() {
            return parent.to_path_buf();
        }
    }
    start.to_path_buf()
}

#[must_use]
pub fn is_generic_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| {
            GENERIC_DIR_NAMES
                .iter()
                .any(|generic| generic.eq_ignore_ascii_case(name))
        })
        .unwrap_or(false)
}

/// Reads the current branch from `.git/HEAD`. Handles worktree `.git` files
/// that point elsewhere via `gitdir:`. Detached heads yield `None`.
pub fn read_git_branch(root: &Path) -> Option<String> {
    let git_entry = root.join(VCS_MARKER);
    let git_dir = if git_entry.is_dir() {
        git_entry
    } else if git_entry.is_file() {
        parse_gitdir(&git_entry, root)?
    } else {
        return None;
    };

    let head = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let branch = head.trim().strip_prefix("ref: refs/heads/")?.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}

fn parse_gitdir(git_file: &Path, worktree_root: &Path) -> Option<PathBuf> {
    let contents = std::fs::read_to_string(git_file).ok()?;
    let line = contents
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("gitdir:"))?;
    let raw = line.get("gitdir:".len()..)?.trim();
    if raw.is_empty() {
        return None;
    }
    let path = Path::new(raw);
    Some(if path.is_absolute() {
        path.to_path_buf()
    } else {
        worktree_root.join(path)
    })
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Canonical when the path exists, otherwise as given; trailing separators
/// are dropped either way.
pub fn normalize_path(path: &Path) -> PathBuf {
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let raw = path_to_string(&resolved);
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path_to_string(path))
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
