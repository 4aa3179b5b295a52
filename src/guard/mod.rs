//! Command safety guard
//!
//! Pure allow/block decision for a command string against a fixed list of
//! destructive-pattern rules plus any operator-supplied deny patterns.
//! Blocked commands are reported upstream as policy violations and never
//! reach a shell.

mod rules;

use crate::error::{Error, Result};
use regex::Regex;
pub use rules::{builtin_rules, RuleSpec};

/// Which rule blocked a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: String,
    pub description: String,
}

/// Deny-list command classifier
pub struct CommandGuard {
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    name: String,
    pattern: Regex,
    description: String,
}

impl CommandGuard {
    /// Built-in rules plus `extra_patterns`
    pub fn new(extra_patterns: &[String]) -> Result<Self> {
        let extra = extra_patterns.iter().enumerate().map(|(i, pattern)| RuleSpec {
            name: format!("custom_{}", i + 1),
            pattern: pattern.clone(),
            description: format!("Matches configured deny pattern {:?}", pattern),
        });
        Self::from_rules(builtin_rules().into_iter().chain(extra))
    }

    /// Compile an explicit rule set
    pub fn from_rules(rules: impl IntoIterator<Item = RuleSpec>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    Error::Guard(format!("Invalid pattern for rule '{}': {}", rule.name, e))
                })?;
                Ok(CompiledRule {
                    name: rule.name,
                    pattern,
                    description: rule.description,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules })
    }

    /// First rule the command matches, if any
    pub fn check(&self, command: &str) -> Option<Violation> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(command))
            .map(|rule| Violation {
                rule: rule.name.clone(),
                description: rule.description.clone(),
            })
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        self.check(command).is_some()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> CommandGuard {
        CommandGuard::new(&[]).unwrap()
    }

    fn rule_for(command: &str) -> Option<String> {
        guard().check(command).map(|v| v.rule)
    }

    #[test]
    fn test_blocks_recursive_root_delete() {
        for cmd in [
            "rm -rf /",
            "rm -fr /",
            "rm -r -f /",
            "sudo rm -rf /*",
            "rm -rf ~",
            "rm -Rf ~/",
            "rm --recursive --force /",
            "rm -rf \"/\"",
            "cd /tmp && rm -rf $HOME",
            "rm -rf / ; echo done",
            "rm -rf ./build /",
            "rm -rf /tmp/x ~",
            "rm -rf foo /*",
            "rm -rf //",
            "rm -rf /.",
        ] {
            assert!(guard().is_blocked(cmd), "expected block: {}", cmd);
        }
        assert_eq!(rule_for("rm -rf /").as_deref(), Some("recursive_root_delete"));
    }

    #[test]
    fn test_blocks_system_directory_delete() {
        assert_eq!(
            rule_for("rm -rf /etc").as_deref(),
            Some("recursive_system_delete")
        );
        assert!(guard().is_blocked("rm -rf /usr/"));
        assert!(guard().is_blocked("rm -r /boot/*"));
        assert!(guard().is_blocked("rm -rf ./build /etc"));
    }

    #[test]
    fn test_allows_scoped_deletes() {
        for cmd in [
            "rm -rf /tmp/build",
            "rm -rf ./target",
            "rm -rf ~/projects/old",
            "rm file.txt",
            "rm -f /etc/app/cache.db",
            "rm -rf /var/tmp/x",
            "rm -rf build; ls /",
            "rm -rf ./a && cd /",
        ] {
            assert!(!guard().is_blocked(cmd), "expected allow: {}", cmd);
        }
    }

    #[test]
    fn test_blocks_format_and_disk_writes() {
        assert_eq!(
            rule_for("mkfs.ext4 /dev/sda1").as_deref(),
            Some("filesystem_format")
        );
        assert_eq!(rule_for("sudo mkfs -t xfs /dev/nvme0n1").as_deref(), Some("filesystem_format"));
        assert_eq!(
            rule_for("dd if=/dev/zero of=/dev/sda bs=1M").as_deref(),
            Some("raw_disk_write")
        );
        assert_eq!(
            rule_for("cat image.iso > /dev/sdb").as_deref(),
            Some("block_device_redirect")
        );
        assert_eq!(rule_for("format c:").as_deref(), Some("windows_format"));
    }

    #[test]
    fn test_allows_benign_dd_and_redirects() {
        assert!(!guard().is_blocked("dd if=/dev/urandom of=./random.bin count=1"));
        assert!(!guard().is_blocked("echo hi > /dev/null"));
        assert!(!guard().is_blocked("ls -la /dev/sda"));
    }

    #[test]
    fn test_blocks_fork_bomb_and_power() {
        assert_eq!(rule_for(":(){ :|:& };:").as_deref(), Some("fork_bomb"));
        assert_eq!(rule_for("sudo reboot").as_deref(), Some("system_power"));
        assert_eq!(rule_for("shutdown -h now").as_deref(), Some("system_power"));
        assert!(!guard().is_blocked("echo reboot required"));
        assert!(!guard().is_blocked("systemctl status"));
    }

    #[test]
    fn test_blocks_recursive_root_chmod() {
        assert_eq!(
            rule_for("chmod -R 777 /").as_deref(),
            Some("recursive_root_permissions")
        );
        assert!(guard().is_blocked("sudo chown -R nobody:nogroup /"));
        assert!(!guard().is_blocked("chmod -R 755 ./dist"));
    }

    #[test]
    fn test_is_deterministic() {
        let g = guard();
        let cmd = "rm -rf /";
        assert_eq!(g.check(cmd), g.check(cmd));
        assert!(g.check("ls -la").is_none());
    }

    #[test]
    fn test_extra_patterns() {
        let g = CommandGuard::new(&["curl[^|]*\\|\\s*(?:ba)?sh".to_string()]).unwrap();
        assert_eq!(g.rule_count(), guard().rule_count() + 1);
        let violation = g.check("curl https://x.sh | sh").unwrap();
        assert_eq!(violation.rule, "custom_1");
        assert!(!g.is_blocked("curl https://example.com -o page.html"));
    }

    #[test]
    fn test_invalid_extra_pattern_is_error() {
        let result = CommandGuard::new(&["(unclosed".to_string()]);
        assert!(matches!(result, Err(Error::Guard(_))));
    }
}
