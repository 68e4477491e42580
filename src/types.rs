use std::fmt;
use std::path::Path;
use std::str::FromStr;

const PATH_DIR_PREFIX: &str = "path=";

/// Identity of a backup target: a host domain name or the canonical absolute
/// path of a target artifact. Also the unit written to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(String);

impl TargetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_path(&self) -> bool {
        self.0.starts_with('/')
    }

    /// Directory name holding this target's generations under the backup dir.
    /// Distinct ids always get distinct names: domain names are used as is,
    /// paths are percent-escaped behind a `path=` prefix no domain name can
    /// carry.
    pub fn dir_name(&self) -> String {
        if !self.is_path() {
            return self.0.clone();
        }
        let mut name = String::from(PATH_DIR_PREFIX);
        for c in self.0.trim_start_matches('/').chars() {
            match c {
                '%' => name.push_str("%25"),
                '/' => name.push_str("%2F"),
                c => name.push(c),
            }
        }
        name
    }
}

impl FromStr for TargetId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "." || s == ".." {
            return Err("target id is empty".to_string());
        }
        if s.chars().any(|c| c.is_control()) {
            return Err(format!("target id {:?} contains control characters", s));
        }
        if Path::new(s).is_absolute() {
            return Ok(TargetId(s.to_string()));
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '+' | '@');
        if !s.chars().all(allowed) {
            return Err(format!(
                "target id {} must be an absolute path or use only letters, digits, '.', '-', '_', ':', '+', '@'",
                s
            ));
        }
        Ok(TargetId(s.to_string()))
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the scheduler does after a target fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Abort,
    Skip,
}

impl FailurePolicy {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" => Ok(FailurePolicy::Skip),
            _ => Err(format!(
                "invalid failure policy {}; expected abort or skip",
                value
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Abort => "abort",
            FailurePolicy::Skip => "skip",
        }
    }
}

/// What happens to a generation directory whose backup did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedGenerationPolicy {
    Delete,
    Keep,
    Quarantine,
}

impl FailedGenerationPolicy {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(FailedGenerationPolicy::Delete),
            "keep" => Ok(FailedGenerationPolicy::Keep),
            "quarantine" => Ok(FailedGenerationPolicy::Quarantine),
            _ => Err(format!(
                "invalid failed generation policy {}; expected delete, keep, or quarantine",
                value
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailedGenerationPolicy::Delete => "delete",
            FailedGenerationPolicy::Keep => "keep",
            FailedGenerationPolicy::Quarantine => "quarantine",
        }
    }
}

/// Pipeline step a target backup failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStep {
    Enumeration,
    Admission,
    Rotation,
    Export,
    Detach,
    Copy,
    Suspend,
    Capture,
    Restore,
}

impl FailedStep {
    /// Storage-level failures that abort the run under every policy.
    pub fn aborts_run(&self) -> bool {
        matches!(self, FailedStep::Admission | FailedStep::Rotation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailedStep::Enumeration => "enumeration",
            FailedStep::Admission => "admission",
            FailedStep::Rotation => "rotation",
            FailedStep::Export => "export",
            FailedStep::Detach => "detach",
            FailedStep::Copy => "copy",
            FailedStep::Suspend => "suspend",
            FailedStep::Capture => "capture",
            FailedStep::Restore => "restore",
        }
    }
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub step: FailedStep,
    pub reason: String,
}

impl TargetFailure {
    pub fn new(step: FailedStep, reason: impl fmt::Display) -> Self {
        Self {
            step,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.step, self.reason)
    }
}
