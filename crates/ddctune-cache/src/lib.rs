//! Persistence for learned per-display state.
//!
//! One plain-text file per user holds a line per display. Saving rewrites
//! the file atomically (temp sibling + rename). Loading is all-or-nothing:
//! a single bad line discards the whole file and reports every problem, and
//! the caller carries on with defaults. Cache trouble is never fatal.
//!
//! A restored record is only trusted after its EDID checksum byte has been
//! re-verified against the live monitor; see
//! [`ddctune_core::Registry::get_or_create`].

mod format;

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use ddctune_core::{DisplayRecord, DisplayState, RecordDefaults, Registry};

pub use format::{format_record_line, is_comment, parse_record_line, LineError, ParsedRecord};
pub use format::FORMAT_HEADER;

const PRODUCT_DIR: &str = "ddctune";
const STATS_FILE: &str = "stats";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The stats file failed to parse. Nothing was loaded.
    #[error("stats file {} is corrupt ({} problem lines)", path.display(), causes.len())]
    BadData {
        path: PathBuf,
        causes: Vec<LineError>,
    },

    /// The stats file could not be read or written.
    #[error("cannot access stats file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither `XDG_CACHE_HOME` nor `HOME` is usable.
    #[error("no usable cache directory (set XDG_CACHE_HOME or HOME)")]
    NoCacheDir,
}

/// Per-user stats file path by XDG convention:
/// `$XDG_CACHE_HOME/ddctune/stats`, falling back to
/// `$HOME/.cache/ddctune/stats`.
pub fn default_stats_path() -> Result<PathBuf, CacheError> {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir).join(PRODUCT_DIR).join(STATS_FILE));
    }
    if let Some(home) = std::env::var_os("HOME").filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(home)
            .join(".cache")
            .join(PRODUCT_DIR)
            .join(STATS_FILE));
    }
    Err(CacheError::NoCacheDir)
}

/// Load the stats file into `registry`. Returns the number of records
/// restored; an absent file restores zero and is not an error.
pub fn load_registry(
    path: &Path,
    registry: &Registry,
    defaults: &RecordDefaults,
) -> Result<usize, CacheError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no stats file, starting fresh");
            return Ok(0);
        }
        Err(source) => {
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut parsed = Vec::new();
    let mut causes = Vec::new();
    let mut seen_buses = HashSet::new();
    let mut header_seen = false;

    for (idx, line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        if is_comment(line) {
            continue;
        }
        if !header_seen {
            if line.trim() == FORMAT_HEADER {
                header_seen = true;
            } else {
                causes.push(LineError {
                    line: line_no,
                    detail: format!("expected {FORMAT_HEADER:?} header, got {line:?}"),
                });
                break;
            }
            continue;
        }
        match parse_record_line(line, line_no) {
            Ok(record) => {
                if !seen_buses.insert(record.bus) {
                    causes.push(LineError {
                        line: line_no,
                        detail: format!("duplicate record for {}", record.bus),
                    });
                } else {
                    parsed.push(record);
                }
            }
            Err(cause) => causes.push(cause),
        }
    }

    if !causes.is_empty() {
        return Err(CacheError::BadData {
            path: path.to_path_buf(),
            causes,
        });
    }

    let mut restored = 0;
    for record in parsed {
        let restored_record =
            DisplayRecord::from_cache(record.bus, record.edid_check, record.dsa, defaults);
        if registry.insert_restored(restored_record) {
            restored += 1;
        } else {
            tracing::warn!(bus = %record.bus, "bus already registered, cache line ignored");
        }
    }
    tracing::debug!(path = %path.display(), restored, "stats file loaded");
    Ok(restored)
}

/// Rewrite the stats file from `registry`. Only records whose bus was seen
/// live this run are saved. Returns the number of records written.
pub fn save_registry(path: &Path, registry: &Registry) -> Result<usize, CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut lines = Vec::new();
    registry.apply_all_sorted(|record| {
        if record.state().contains(DisplayState::BUS_DETECTED) {
            lines.push(format_record_line(record));
        }
    });

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    // Write-temp-then-rename so a crash mid-write never clobbers the
    // previous state.
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(io_err)?;
        writeln!(file, "# ddctune per-display statistics").map_err(io_err)?;
        writeln!(file, "{FORMAT_HEADER}").map_err(io_err)?;
        for line in &lines {
            writeln!(file, "{line}").map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
    }
    std::fs::rename(&tmp_path, path).map_err(io_err)?;

    tracing::debug!(path = %path.display(), saved = lines.len(), "stats file written");
    Ok(lines.len())
}
