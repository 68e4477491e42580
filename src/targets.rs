//! Turning command line / config patterns into the set of backup targets.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{BackupError, ConfigError, Result};
use crate::host::VirtHost;
use crate::types::TargetId;
use crate::util::paths::absolute;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    /// Host domain the pipeline operates on.
    pub domain: String,
}

impl Target {
    /// A target identified by its host domain name.
    pub fn domain(id: TargetId) -> Self {
        let domain = id.as_str().to_string();
        Self { id, domain }
    }

    /// A target artifact on disk (an image or exported definition) named
    /// after its domain, e.g. `/vms/web01.qcow2` backs up domain `web01`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let canonical = path
            .canonicalize()
            .map_err(|e| BackupError::message(format!("resolve {}: {}", path.display(), e)))?;
        let id = canonical
            .to_string_lossy()
            .parse::<TargetId>()
            .map_err(|e| BackupError::message(e))?;
        let domain = canonical
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                BackupError::message(format!("{}: no domain name in file name", canonical.display()))
            })?;
        Ok(Self { id, domain })
    }
}

fn has_glob_meta(s: &str) -> bool {
    s.contains(['*', '?', '[', '{'])
}

fn compile(pattern: &str, literal_separator: bool) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(literal_separator)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| ConfigError::Invalid(format!("target pattern {}: {}", pattern, e)).into())
}

/// Files matching a filesystem glob; `*` stays within one directory level.
fn expand_path_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let absolute = absolute(Path::new(pattern))?;
    let pattern_str = absolute.to_string_lossy().to_string();
    let matcher = compile(&pattern_str, true)?;

    let mut base = PathBuf::new();
    let mut remaining = Vec::new();
    for component in absolute.components() {
        let text = component.as_os_str().to_string_lossy();
        if remaining.is_empty() && !has_glob_meta(&text) && !matches!(component, Component::ParentDir) {
            base.push(component);
        } else {
            remaining.push(text.to_string());
        }
    }
    let mut walker = WalkDir::new(&base).follow_links(true);
    if !remaining.iter().any(|c| c.contains("**")) {
        walker = walker.max_depth(remaining.len());
    }

    let mut matched = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) != Some(std::io::ErrorKind::NotFound) {
                    warn!(pattern, error = %err, "skipping unreadable path");
                }
                continue;
            }
        };
        if entry.file_type().is_file() && matcher.is_match(entry.path()) {
            matched.push(entry.path().to_path_buf());
        }
    }
    Ok(matched)
}

/// Expands target patterns. Patterns containing `/` are filesystem globs,
/// anything else is matched against the host's domain names; no patterns at
/// all selects every domain.
pub fn expand_targets<H: VirtHost + ?Sized>(patterns: &[String], host: &H) -> Result<Vec<Target>> {
    let mut targets = BTreeMap::new();
    let mut domains: Option<Vec<String>> = None;

    let domain_patterns: Vec<&str> = if patterns.is_empty() {
        vec!["*"]
    } else {
        patterns
            .iter()
            .map(String::as_str)
            .filter(|p| !p.contains('/'))
            .collect()
    };

    for pattern in patterns.iter().filter(|p| p.contains('/')) {
        let files = expand_path_pattern(pattern)?;
        if files.is_empty() {
            warn!(pattern = %pattern, "pattern matched no files");
        }
        for file in files {
            let target = Target::from_path(&file)?;
            debug!(pattern = %pattern, vm = %target.id, domain = %target.domain, "matched");
            targets.insert(target.id.clone(), target);
        }
    }

    for pattern in domain_patterns {
        let matcher = compile(pattern, false)?;
        if domains.is_none() {
            domains = Some(host.list_domains()?);
        }
        let mut hits = 0;
        for name in domains.iter().flatten() {
            if !matcher.is_match(name) {
                continue;
            }
            match name.parse::<TargetId>() {
                Ok(id) => {
                    hits += 1;
                    targets.insert(id.clone(), Target::domain(id));
                }
                Err(err) => warn!(domain = %name, error = %err, "skipping domain"),
            }
        }
        if hits == 0 {
            warn!(pattern, "pattern matched no domains");
        }
    }

    Ok(targets.into_values().collect())
}
