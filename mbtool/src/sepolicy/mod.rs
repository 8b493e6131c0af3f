// src/sepolicy/mod.rs

//! SELinux policy patching.
//!
//! At startup the daemon lets untrusted apps connect to it by adding a single
//! allow rule to the running policy and loading the result back into the
//! kernel. Whether the app is actually let in is decided later by the
//! signature check.

mod policydb;

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub use policydb::{AVTAB_ALLOWED, AvtabDatum, AvtabEntry, PolicyDb};

use crate::constants;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("bad policy magic: {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported policy version: {0}")]
    UnsupportedVersion(u32),
    #[error("policy truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("malformed policy at byte {offset}: {what}")]
    Malformed { offset: usize, what: &'static str },
    #[error("type {0} does not exist")]
    UnknownType(String),
    #[error("class {0} does not exist")]
    UnknownClass(String),
    #[error("permission {perm} does not exist in class {class}")]
    UnknownPerm { class: String, perm: String },
    #[error("{kind} value {value} does not fit in an avtab key")]
    ValueOutOfRange { kind: &'static str, value: u32 },
}

/// An allow rule, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowRule<'a> {
    pub source: &'a str,
    pub target: &'a str,
    pub class: &'a str,
    pub perm: &'a str,
}

/// The rule that lets apps reach the daemon's socket.
pub const DAEMON_CONNECT_RULE: AllowRule<'static> = AllowRule {
    source: constants::APP_DOMAIN,
    target: constants::DAEMON_DOMAIN,
    class: constants::SOCKET_CLASS,
    perm: constants::CONNECT_PERM,
};

fn avtab_value(kind: &'static str, value: u32) -> Result<u16, PolicyError> {
    u16::try_from(value).map_err(|_| PolicyError::ValueOutOfRange { kind, value })
}

impl PolicyDb {
    /// Adds `rule` to the access vector table.
    ///
    /// Returns `false` if the rule was already granted, in which case the
    /// table is left untouched.
    pub fn add_allow(&mut self, rule: &AllowRule) -> Result<bool, PolicyError> {
        let source = self
            .type_value(rule.source)
            .ok_or_else(|| PolicyError::UnknownType(rule.source.to_string()))?;
        let target = self
            .type_value(rule.target)
            .ok_or_else(|| PolicyError::UnknownType(rule.target.to_string()))?;
        let class = self
            .class(rule.class)
            .ok_or_else(|| PolicyError::UnknownClass(rule.class.to_string()))?;
        let perm = self
            .perm_value(class, rule.perm)
            .filter(|v| (1..=32).contains(v))
            .ok_or_else(|| PolicyError::UnknownPerm {
                class: rule.class.to_string(),
                perm: rule.perm.to_string(),
            })?;

        let source = avtab_value("type", source)?;
        let target = avtab_value("type", target)?;
        let class = avtab_value("class", class.value)?;
        let bit = 1u32 << (perm - 1);

        let existing = self.avtab.iter_mut().find(|e| {
            e.source_type == source
                && e.target_type == target
                && e.target_class == class
                && e.specified == AVTAB_ALLOWED
        });

        match existing {
            Some(AvtabEntry {
                datum: AvtabDatum::Data(data),
                ..
            }) => {
                if *data & bit != 0 {
                    return Ok(false);
                }
                *data |= bit;
            }
            // Allowed entries never carry extended permissions.
            Some(_) => unreachable!("AVTAB_ALLOWED entry with xperms datum"),
            None => self.avtab.push(AvtabEntry {
                source_type: source,
                target_type: target,
                target_class: class,
                specified: AVTAB_ALLOWED,
                datum: AvtabDatum::Data(bit),
            }),
        }

        Ok(true)
    }
}

/// Reads and parses the policy at `path`.
pub fn read_policy(path: &Path) -> Result<PolicyDb> {
    let raw = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let db = PolicyDb::parse(raw)
        .with_context(|| format!("Failed to parse policy {}", path.display()))?;
    Ok(db)
}

/// Writes the policy to `path` in a single write, as selinuxfs requires.
pub fn write_policy(path: &Path, db: &PolicyDb) -> Result<()> {
    let data = db.to_bytes();
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(&data)
        .with_context(|| format!("Failed to write policy to {}", path.display()))?;
    Ok(())
}

/// Allows untrusted apps to connect to the daemon.
///
/// Loads the policy from `source`, adds [`DAEMON_CONNECT_RULE`] and writes the
/// result to `target`. The policy is written back even if the rule was
/// already present.
pub fn patch_daemon_policy(source: &Path, target: &Path) -> Result<()> {
    let mut db = read_policy(source)?;
    debug!("Policy version: {} (MLS: {})", db.version, db.mls);

    let rule = DAEMON_CONNECT_RULE;
    let added = db
        .add_allow(&rule)
        .with_context(|| format!("Failed to add rule {rule:?}"))?;
    if added {
        info!(
            "Added rule: allow {} {}:{} {}",
            rule.source, rule.target, rule.class, rule.perm
        );
    } else {
        debug!("Rule already present: {rule:?}");
    }

    write_policy(target, &db)
}
