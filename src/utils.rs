//! Utility functions for paths, disk space and message text

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Maximum number of suffixes tried when resolving a name collision
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Path that an existing dataset directory is moved aside to before a fresh capture
///
/// The old directory `Dataset` becomes `x_Dataset`; if that exists too,
/// `x_Dataset_1`, `x_Dataset_2`, ... are tried in order.
///
/// # Examples
///
/// ```
/// use capture_manager::utils::move_aside_path;
/// use std::path::Path;
///
/// let target = move_aside_path(Path::new("/nonexistent/storage/Sample_01")).unwrap();
/// assert_eq!(target, Path::new("/nonexistent/storage/x_Sample_01"));
/// ```
pub fn move_aside_path(path: &Path) -> Result<PathBuf> {
    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        Error::Other(format!("cannot extract directory name from '{}'", path.display()))
    })?;
    let parent = path.parent().ok_or_else(|| {
        Error::Other(format!("cannot extract parent directory of '{}'", path.display()))
    })?;

    let candidate = parent.join(format!("x_{}", name));
    if !candidate.exists() {
        return Ok(candidate);
    }

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = parent.join(format!("x_{}_{}", name, i));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(Error::Other(format!(
        "could not find a free move-aside name for '{}' after {} attempts",
        path.display(),
        MAX_RENAME_ATTEMPTS
    )))
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux / macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zeroed
        // before the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // f_bavail = blocks available to unprivileged users
            Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every output pointer refers
        // to a live, aligned u64 that is only read after a successful call.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

/// Free space on the volume that holds `path`
///
/// The destination dataset directory usually does not exist yet, so the
/// nearest existing ancestor is queried.
pub fn available_space_for(path: &Path) -> Result<u64> {
    let mut probe = path;
    while !probe.exists() {
        probe = match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if probe == Path::new(".") {
            break;
        }
    }
    get_available_space(probe).map_err(|e| {
        Error::DiskSpaceCheckFailed(format!(
            "failed to query free space for '{}': {}",
            probe.display(),
            e
        ))
    })
}

/// Verify that the volume holding `path` has at least `required` bytes free
pub fn check_free_space(path: &Path, required: u64) -> Result<u64> {
    let available = available_space_for(path)?;
    if available < required {
        return Err(Error::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(available)
}

/// Human-readable byte count (e.g. "29.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} bytes", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Truncate to at most `max_chars` characters, respecting char boundaries
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Collapse line breaks to "; ", trim, then cap the length
pub fn clean_message(text: &str, max_chars: usize) -> String {
    let single_line = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    truncate_chars(&single_line, max_chars)
}

/// Normalized Levenshtein similarity in `[0, 1]`, compared case-insensitively
///
/// 1.0 means identical; 0.0 means nothing in common.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    1.0 - previous[b.len()] as f64 / longest as f64
}
