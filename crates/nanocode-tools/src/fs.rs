use crate::ToolError;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub(crate) fn read_file(
    path: &Path,
    display: &str,
    offset: Option<i64>,
    limit: Option<i64>,
) -> Result<String, ToolError> {
    let meta = fs::metadata(path).map_err(|err| io_error(display, &err))?;
    if meta.is_dir() {
        return Err(ToolError::Environment(format!(
            "{display}: is a directory, use glob to list its contents"
        )));
    }
    let bytes = fs::read(path).map_err(|err| io_error(display, &err))?;
    if is_binary(&bytes) {
        return Err(ToolError::Environment(format!(
            "{display}: binary file, cannot display"
        )));
    }
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();

    if lines.is_empty() {
        if offset.is_some() || limit.is_some() {
            return Err(ToolError::Environment(format!(
                "{display}: file is empty, offset/limit cannot be applied"
            )));
        }
        return Ok("(empty file)".to_string());
    }

    let (start, end) = line_window(lines.len(), offset, limit);
    let rendered: Vec<String> = lines[start..end]
        .iter()
        .enumerate()
        .map(|(idx, line)| format!("{:>4}| {line}", start + idx + 1))
        .collect();
    Ok(rendered.join("\n"))
}

/// Clamps a skip/take window to `[0, len)`. Always selects at least one line.
fn line_window(len: usize, offset: Option<i64>, limit: Option<i64>) -> (usize, usize) {
    let last = len.saturating_sub(1);
    let start = usize::try_from(offset.unwrap_or(0).max(0))
        .unwrap_or(usize::MAX)
        .min(last);
    let count = match limit {
        Some(limit) => usize::try_from(limit.max(1)).unwrap_or(usize::MAX),
        None => usize::MAX,
    };
    (start, start.saturating_add(count).min(len))
}

pub(crate) fn write_file(path: &Path, display: &str, content: &str) -> Result<String, ToolError> {
    if path.is_dir() {
        return Err(ToolError::Environment(format!(
            "{display}: is an existing directory"
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| io_error(display, &err))?;
    }
    fs::write(path, content).map_err(|err| io_error(display, &err))?;
    Ok(format!("wrote {} bytes to {display}", content.len()))
}

pub(crate) fn edit_file(
    path: &Path,
    display: &str,
    old_string: &str,
    new_string: &str,
) -> Result<String, ToolError> {
    if old_string.is_empty() {
        return Err(ToolError::InvalidArgument(
            "old_string: must not be empty".to_string(),
        ));
    }
    let meta = fs::metadata(path).map_err(|err| io_error(display, &err))?;
    if meta.is_dir() {
        return Err(ToolError::Environment(format!("{display}: is a directory")));
    }
    let content = fs::read_to_string(path).map_err(|err| match err.kind() {
        io::ErrorKind::InvalidData => {
            ToolError::Environment(format!("{display}: not a UTF-8 text file"))
        }
        _ => io_error(display, &err),
    })?;

    let count = content.matches(old_string).count();
    let Some(pos) = content.find(old_string) else {
        return Err(ToolError::Environment(format!(
            "old_string not found in {display}"
        )));
    };
    if count > 1 {
        return Err(ToolError::Environment(format!(
            "old_string appears {count} times in {display}, it must be unique; include more surrounding context"
        )));
    }

    let updated = content.replacen(old_string, new_string, 1);
    write_atomic(path, updated.as_bytes(), &meta.permissions())
        .map_err(|err| io_error(display, &err))?;
    let line = content[..pos].matches('\n').count() + 1;
    Ok(format!("edited {display} at line {line}"))
}

/// Writes through a sibling temp file and renames it over `path`, so a
/// failure part way leaves the original content intact.
fn write_atomic(path: &Path, bytes: &[u8], permissions: &fs::Permissions) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), permissions.clone())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

pub(crate) fn io_error(display: &str, err: &io::Error) -> ToolError {
    let reason = match err.kind() {
        io::ErrorKind::NotFound => "file not found".to_string(),
        io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => err.to_string(),
    };
    ToolError::Environment(format!("{display}: {reason}"))
}

pub(crate) fn is_binary(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if bytes.contains(&0) {
        return true;
    }
    let non_text = bytes
        .iter()
        .take(8192)
        .filter(|b| **b < 0x20 && !matches!(**b, b'\n' | b'\r' | b'\t' | 0x0c | 0x1b))
        .count();
    non_text > 64
}
