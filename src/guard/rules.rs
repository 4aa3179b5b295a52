//! Built-in destructive command rules

/// An uncompiled deny rule
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub name: String,
    pub pattern: String,
    pub description: String,
}

/// Path operands that stand for "everything": `/`, `//`, `/.`, `/*`, `~`,
/// `~/*`, `$HOME`
const ROOT_TARGET: &str = r#"["']?(?:/+\.?/*\*?|~/?\*?|\$HOME/?\*?|\$\{HOME\}/?\*?)["']?"#;

/// Top-level system directories
const SYSTEM_TARGET: &str =
    r#"["']?/(?:bin|boot|dev|etc|lib|lib32|lib64|proc|root|sbin|sys|usr|var)/?\*?["']?"#;

/// Any operands ahead of the dangerous one, within the same command
const OPERANDS: &str = r"(?:[^;&|\s]+\s+)*";

/// End of an operand: whitespace, a shell separator, or end of input
const END: &str = r"(?:\s|;|&|\||\)|$)";

/// `rm` with a recursive flag somewhere among its options
const RM_RECURSIVE: &str =
    r"\brm\s+(?:-[\w-]+\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)\s+(?:-[\w-]+\s+)*";

/// `chmod`/`chown`/`chgrp` with `-R`, followed by its mode/owner operand
const CH_RECURSIVE: &str =
    r"\bch(?:mod|own|grp)\s+(?:-[\w-]+\s+)*(?:-[a-zA-Z]*R[a-zA-Z]*|--recursive)\s+(?:-[\w-]+\s+)*\S+\s+";

const STATIC_RULES: &[(&str, &str, &str)] = &[
    (
        "no_preserve_root",
        r"--no-preserve-root\b",
        "Disables the root-directory safety check",
    ),
    (
        "filesystem_format",
        r"(?:^|[\s;&|(])(?:mkfs(?:\.\w+)?|mke2fs|mkswap|wipefs|newfs(?:_\w+)?)\b",
        "Filesystem format operation",
    ),
    (
        "windows_format",
        r"(?i)\bformat(?:\.com)?\s+[a-z]:",
        "Drive format operation",
    ),
    (
        "raw_disk_write",
        r"\bdd\b[^;&|]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk)\w*",
        "Raw write to a block device",
    ),
    (
        "block_device_redirect",
        r">\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk)\w*",
        "Shell redirect onto a block device",
    ),
    (
        "disk_shred",
        r"\bshred\b[^;&|]*\s/dev/\w+",
        "Overwrite of a device",
    ),
    (
        "fork_bomb",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "Fork bomb",
    ),
    (
        "system_power",
        r"(?:^|[;&|(]\s*|\bsudo\s+)\s*(?:shutdown|reboot|halt|poweroff|init\s+[06])\b",
        "Machine shutdown or reboot",
    ),
];

/// The built-in deny list
pub fn builtin_rules() -> Vec<RuleSpec> {
    let composed = [
        (
            "recursive_root_delete",
            format!("{}{}{}{}", RM_RECURSIVE, OPERANDS, ROOT_TARGET, END),
            "Recursive deletion of the root or home directory",
        ),
        (
            "recursive_system_delete",
            format!("{}{}{}{}", RM_RECURSIVE, OPERANDS, SYSTEM_TARGET, END),
            "Recursive deletion of a system directory",
        ),
        (
            "recursive_root_permissions",
            format!("{}{}{}{}", CH_RECURSIVE, OPERANDS, ROOT_TARGET, END),
            "Recursive permission or ownership change of the root directory",
        ),
    ];

    composed
        .into_iter()
        .map(|(name, pattern, description)| RuleSpec {
            name: name.to_string(),
            pattern,
            description: description.to_string(),
        })
        .chain(STATIC_RULES.iter().map(|(name, pattern, description)| RuleSpec {
            name: name.to_string(),
            pattern: pattern.to_string(),
            description: description.to_string(),
        }))
        .collect()
}
