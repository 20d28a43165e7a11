use crate::ToolError;
use crate::fs::{io_error, is_binary};
use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use regex::Regex;
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const MAX_GREP_LINE_CHARS: usize = 300;

pub(crate) struct SearchOptions {
    pub respect_gitignore: bool,
    pub max_results: usize,
}

pub(crate) fn glob_paths(
    root: &Path,
    display_root: &str,
    pattern: &str,
    opts: &SearchOptions,
) -> Result<String, ToolError> {
    let pattern = pattern.trim_start_matches("./");
    let matcher = Pattern::new(pattern).map_err(|err| {
        ToolError::InvalidArgument(format!("invalid glob pattern '{pattern}': {err}"))
    })?;
    ensure_dir(root, display_root)?;

    let match_opts = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let mut hits: Vec<(bool, Reverse<SystemTime>, String)> = walk_paths(root, opts.respect_gitignore)
        .into_iter()
        .filter_map(|path| {
            let rel = normalize_rel_path(path.strip_prefix(root).ok()?);
            if rel.is_empty() || !matcher.matches_with(&rel, match_opts) {
                return None;
            }
            let meta = fs::metadata(&path).ok()?;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let shown = join_display(display_root, &rel);
            let shown = if meta.is_dir() { format!("{shown}/") } else { shown };
            Some((meta.is_dir(), Reverse(mtime), shown))
        })
        .collect();
    // Files before directories, newest first, then by path.
    hits.sort();

    if hits.is_empty() {
        return Ok("no matches".to_string());
    }
    let total = hits.len();
    let mut lines: Vec<String> = hits
        .into_iter()
        .take(opts.max_results)
        .map(|(_, _, shown)| shown)
        .collect();
    if total > lines.len() {
        lines.push(format!("... {} more", total - lines.len()));
    }
    Ok(lines.join("\n"))
}

pub(crate) fn grep_files(
    root: &Path,
    display_root: &str,
    pattern: &str,
    include: Option<&str>,
    opts: &SearchOptions,
) -> Result<String, ToolError> {
    let regex = Regex::new(pattern)
        .map_err(|err| ToolError::InvalidArgument(format!("invalid regex: {err}")))?;
    let include = include
        .map(|glob| {
            Pattern::new(glob).map_err(|err| {
                ToolError::InvalidArgument(format!("invalid include glob '{glob}': {err}"))
            })
        })
        .transpose()?;
    let meta = fs::metadata(root).map_err(|err| io_error(display_root, &err))?;

    let files: Vec<(PathBuf, String)> = if meta.is_file() {
        vec![(root.to_path_buf(), display_root.to_string())]
    } else {
        let mut files: Vec<(PathBuf, String)> = walk_paths(root, opts.respect_gitignore)
            .into_iter()
            .filter(|path| path.is_file())
            .filter_map(|path| {
                let rel = normalize_rel_path(path.strip_prefix(root).ok()?);
                if let Some(include) = &include {
                    let name = path.file_name()?.to_string_lossy();
                    if !include.matches(&name) && !include.matches(&rel) {
                        return None;
                    }
                }
                let shown = join_display(display_root, &rel);
                Some((path, shown))
            })
            .collect();
        files.sort_by(|a, b| a.1.cmp(&b.1));
        files
    };

    let mut hits = Vec::new();
    let mut truncated = false;
    'files: for (path, shown) in files {
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        if is_binary(&bytes) {
            continue;
        }
        let Ok(text) = std::str::from_utf8(&bytes) else {
            continue;
        };
        for (idx, line) in text.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if hits.len() == opts.max_results {
                truncated = true;
                break 'files;
            }
            let line: String = line.trim_end().chars().take(MAX_GREP_LINE_CHARS).collect();
            hits.push(format!("{shown}:{}:{line}", idx + 1));
        }
    }

    if hits.is_empty() {
        return Ok("no matches".to_string());
    }
    if truncated {
        hits.push(format!(
            "... (showing first {} matches, narrow the pattern or path)",
            opts.max_results
        ));
    }
    Ok(hits.join("\n"))
}

fn ensure_dir(root: &Path, display: &str) -> Result<(), ToolError> {
    let meta = fs::metadata(root).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            ToolError::Environment(format!("{display}: search root not found"))
        }
        _ => io_error(display, &err),
    })?;
    if !meta.is_dir() {
        return Err(ToolError::Environment(format!("{display}: not a directory")));
    }
    Ok(())
}

fn should_skip_rel_path(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == ".git" || c.as_os_str() == ".nanocode")
}

fn walk_paths(root: &Path, respect_gitignore: bool) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(root);
    builder.hidden(false);
    builder.follow_links(false);
    builder.parents(respect_gitignore);
    builder.git_ignore(respect_gitignore);
    builder.git_global(respect_gitignore);
    builder.git_exclude(respect_gitignore);
    builder.ignore(respect_gitignore);
    builder.require_git(false);

    let mut paths = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        if should_skip_rel_path(rel) {
            continue;
        }
        paths.push(path.to_path_buf());
    }
    paths
}

fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn join_display(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() || root == "." {
        rel.to_string()
    } else {
        format!("{root}/{rel}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn opts() -> SearchOptions {
        SearchOptions {
            respect_gitignore: true,
            max_results: 50,
        }
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let file = fs::File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .expect("set mtime");
    }

    #[test]
    fn glob_sorts_by_mtime_descending() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "a").expect("write");
        fs::write(dir.path().join("b.py"), "b").expect("write");
        fs::write(dir.path().join("c.txt"), "c").expect("write");
        set_mtime(&dir.path().join("a.py"), 3600);
        set_mtime(&dir.path().join("b.py"), 60);

        let out = glob_paths(dir.path(), ".", "*.py", &opts()).expect("glob");
        assert_eq!(out, "b.py\na.py");
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("src/nested")).expect("mkdir");
        fs::write(dir.path().join("src/lib.rs"), "").expect("write");
        fs::write(dir.path().join("src/nested/mod.rs"), "").expect("write");

        let out = glob_paths(dir.path(), ".", "src/*.rs", &opts()).expect("glob");
        assert_eq!(out, "src/lib.rs");
        let out = glob_paths(dir.path(), ".", "**/*.rs", &opts()).expect("glob");
        assert_eq!(out.lines().count(), 2, "{out}");
    }

    #[test]
    fn glob_prefixes_display_root_and_caps_results() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("pkg")).expect("mkdir");
        for name in ["a.rs", "b.rs", "c.rs"] {
            fs::write(dir.path().join("pkg").join(name), "").expect("write");
        }
        let capped = SearchOptions {
            respect_gitignore: true,
            max_results: 2,
        };
        let out = glob_paths(&dir.path().join("pkg"), "pkg", "*.rs", &capped).expect("glob");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("pkg/"));
        assert_eq!(lines[2], "... 1 more");
    }

    #[test]
    fn glob_respects_gitignore() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join(".gitignore"), "build/\n").expect("write");
        fs::create_dir_all(dir.path().join("build")).expect("mkdir");
        fs::write(dir.path().join("build/out.rs"), "").expect("write");
        fs::write(dir.path().join("main.rs"), "").expect("write");
        let out = glob_paths(dir.path(), ".", "**/*.rs", &opts()).expect("glob");
        assert_eq!(out, "main.rs");
    }

    #[test]
    fn glob_errors() {
        let dir = TempDir::new().expect("tempdir");
        let err = glob_paths(dir.path(), ".", "[", &opts()).expect_err("bad pattern");
        assert!(matches!(err, ToolError::InvalidArgument(_)));
        let err = glob_paths(&dir.path().join("missing"), "missing", "*", &opts())
            .expect_err("missing root");
        assert!(matches!(err, ToolError::Environment(_)));
        assert_eq!(glob_paths(dir.path(), ".", "*.zig", &opts()).expect("glob"), "no matches");
    }

    #[test]
    fn grep_reports_file_line_and_text() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(dir.path().join("a.py"), "import os\ndef foo():\n    pass\n").expect("write");
        fs::write(dir.path().join("b.txt"), "def foo in text\n").expect("write");

        let out = grep_files(dir.path(), ".", r"def \w+", None, &opts()).expect("grep");
        assert_eq!(out, "a.py:2:def foo():\nb.txt:1:def foo in text");

        let out = grep_files(dir.path(), ".", r"def \w+", Some("*.py"), &opts()).expect("grep");
        assert_eq!(out, "a.py:2:def foo():");
    }

    #[test]
    fn grep_accepts_a_single_file_and_caps_hits() {
        let dir = TempDir::new().expect("tempdir");
        let body: String = (0..10).map(|i| format!("hit {i}\n")).collect();
        fs::write(dir.path().join("log.txt"), body).expect("write");
        let capped = SearchOptions {
            respect_gitignore: true,
            max_results: 3,
        };
        let out = grep_files(&dir.path().join("log.txt"), "log.txt", "hit", None, &capped)
            .expect("grep");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "log.txt:1:hit 0");
        assert!(lines[3].contains("showing first 3"));
    }

    #[test]
    fn grep_errors() {
        let dir = TempDir::new().expect("tempdir");
        let err = grep_files(dir.path(), ".", "(", None, &opts()).expect_err("bad regex");
        assert!(matches!(err, ToolError::InvalidArgument(_)));
        let err = grep_files(&dir.path().join("nope"), "nope", "x", None, &opts())
            .expect_err("missing path");
        assert!(matches!(err, ToolError::Environment(_)));
    }
}
