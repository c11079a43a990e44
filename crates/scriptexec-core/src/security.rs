//! Script content validation.
//!
//! A cheap first gate over the script body: size and line caps, then a
//! command-name denylist and optional allowlist. Defense in depth continues
//! at the cluster — non-root execution, read-only root filesystem, dropped
//! capabilities — so this validator only needs to catch the obvious.

use std::collections::BTreeSet;

use thiserror::Error;

/// Default byte cap for in-band script content (500 KiB).
pub const DEFAULT_MAX_SCRIPT_SIZE: usize = 524_288;

/// Default line cap for in-band script content.
pub const DEFAULT_MAX_SCRIPT_LINES: usize = 1_000;

/// Errors from script content validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The script exceeds the byte cap.
    #[error("script too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Actual byte length.
        size: usize,
        /// Configured cap.
        max: usize,
    },

    /// The script exceeds the line cap.
    #[error("script too long: {lines} lines (max: {max})")]
    TooLong {
        /// Actual line count.
        lines: usize,
        /// Configured cap.
        max: usize,
    },

    /// A command matches the denylist.
    #[error("blocked command detected: {0}")]
    BlockedCommand(String),

    /// A command matches nothing on the configured allowlist.
    #[error("command not in allowlist: {0}")]
    NotAllowed(String),
}

/// Validates in-band script content.
#[derive(Debug, Clone)]
pub struct ScriptValidator {
    blocked_commands: Vec<String>,
    allowed_commands: Vec<String>,
    max_size: usize,
    max_lines: usize,
}

impl ScriptValidator {
    /// Creates a validator. Zero caps fall back to the defaults.
    #[must_use]
    pub fn new(
        blocked_commands: Vec<String>,
        allowed_commands: Vec<String>,
        max_size: usize,
        max_lines: usize,
    ) -> Self {
        Self {
            blocked_commands,
            allowed_commands,
            max_size: if max_size == 0 {
                DEFAULT_MAX_SCRIPT_SIZE
            } else {
                max_size
            },
            max_lines: if max_lines == 0 {
                DEFAULT_MAX_SCRIPT_LINES
            } else {
                max_lines
            },
        }
    }

    /// Checks caps and command rules, in that order.
    pub fn validate(&self, script: &str) -> Result<(), ValidationError> {
        if script.len() > self.max_size {
            return Err(ValidationError::TooLarge {
                size: script.len(),
                max: self.max_size,
            });
        }

        let lines = script.split('\n').count();
        if lines > self.max_lines {
            return Err(ValidationError::TooLong {
                lines,
                max: self.max_lines,
            });
        }

        let commands = extract_commands(script);

        for command in &commands {
            if self
                .blocked_commands
                .iter()
                .any(|pattern| matches_command(command, pattern))
            {
                return Err(ValidationError::BlockedCommand(command.clone()));
            }
        }

        if !self.allowed_commands.is_empty() {
            for command in &commands {
                let allowed = self
                    .allowed_commands
                    .iter()
                    .any(|pattern| matches_command(command, pattern));
                if !allowed {
                    return Err(ValidationError::NotAllowed(command.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Collects the distinct command names a script invokes.
///
/// Takes the first whitespace-separated token of each non-empty,
/// non-comment line, strips leading pipe and chaining operators, and
/// promotes `sudo X` / `su X` to `X`.
fn extract_commands(script: &str) -> BTreeSet<String> {
    let mut commands = BTreeSet::new();
    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        let mut command = first
            .trim_start_matches('|')
            .trim_start_matches("&&")
            .trim_start_matches("||")
            .trim_start_matches(';');
        if command == "sudo" || command == "su" {
            if let Some(target) = fields.next() {
                command = target;
            }
        }
        commands.insert(command.to_string());
    }
    commands
}

/// Exact match, or prefix match when the pattern ends with `*`.
fn matches_command(command: &str, pattern: &str) -> bool {
    if command == pattern {
        return true;
    }
    pattern
        .strip_suffix('*')
        .is_some_and(|prefix| command.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(blocked: &[&str], allowed: &[&str]) -> ScriptValidator {
        ScriptValidator::new(
            blocked.iter().map(ToString::to_string).collect(),
            allowed.iter().map(ToString::to_string).collect(),
            0,
            0,
        )
    }

    #[test]
    fn size_cap_is_exact() {
        let v = ScriptValidator::new(vec![], vec![], 16, 0);
        assert!(v.validate(&"a".repeat(16)).is_ok());
        let err = v.validate(&"a".repeat(17)).unwrap_err();
        assert!(matches!(err, ValidationError::TooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn line_cap_is_exact() {
        let v = ScriptValidator::new(vec![], vec![], 0, 3);
        assert!(v.validate("a\nb\nc").is_ok());
        let err = v.validate("a\nb\nc\nd").unwrap_err();
        assert!(matches!(err, ValidationError::TooLong { lines: 4, max: 3 }));
    }

    #[test]
    fn blocked_command_detected() {
        let v = validator(&["rm"], &[]);
        let err = v.validate("rm -rf /data").unwrap_err();
        assert_eq!(err, ValidationError::BlockedCommand("rm".into()));
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let v = validator(&["rm"], &[]);
        assert!(v.validate("# rm -rf /\n\n  \necho ok").is_ok());
    }

    #[test]
    fn sudo_and_su_promote_target() {
        let v = validator(&["systemctl"], &[]);
        let err = v.validate("sudo systemctl restart nginx").unwrap_err();
        assert_eq!(err, ValidationError::BlockedCommand("systemctl".into()));
        let err = v.validate("su systemctl").unwrap_err();
        assert_eq!(err, ValidationError::BlockedCommand("systemctl".into()));
    }

    #[test]
    fn chained_operators_stripped() {
        let v = validator(&["curl"], &[]);
        let err = v.validate("&&curl http://example.com").unwrap_err();
        assert_eq!(err, ValidationError::BlockedCommand("curl".into()));
        assert!(v.validate("|grep ok").is_ok());
    }

    #[test]
    fn star_pattern_is_prefix_match() {
        let v = validator(&["mkfs*"], &[]);
        assert!(matches!(
            v.validate("mkfs.ext4 /dev/sdb1"),
            Err(ValidationError::BlockedCommand(_))
        ));
        // Without a star, only exact names match.
        let v = validator(&["mkfs"], &[]);
        assert!(v.validate("mkfs.ext4 /dev/sdb1").is_ok());
    }

    #[test]
    fn allowlist_restricts_when_present() {
        let v = validator(&[], &["echo", "kubectl*"]);
        assert!(v.validate("echo hi\nkubectl get pods").is_ok());
        let err = v.validate("echo hi\ncurl http://x").unwrap_err();
        assert_eq!(err, ValidationError::NotAllowed("curl".into()));
    }

    #[test]
    fn duplicate_commands_collapse() {
        let v = validator(&[], &["echo"]);
        assert!(v.validate("echo a\necho b\necho c").is_ok());
    }
}
