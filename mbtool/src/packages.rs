// src/packages.rs

//! Signature registry backed by the package manager's `packages.xml`.
//!
//! The file is re-read on every lookup. Certificates are stored once per
//! file: the first `<cert>` carrying a `key` for some `index` defines it and
//! later elements refer back to it by index only.

use anyhow::Result;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::credentials::{PackageSignatures, SignatureRegistry};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed XML at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("malformed attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("invalid {attr}={value:?} on <{element}>")]
    BadValue {
        element: String,
        attr: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerKind {
    Package,
    SharedUser,
}

#[derive(Debug)]
struct Owner {
    kind: OwnerKind,
    name: String,
    uid: Option<u32>,
    shared_uid: Option<u32>,
    sig_indexes: Vec<String>,
}

impl Owner {
    fn owns(&self, uid: u32) -> bool {
        self.uid == Some(uid) || self.shared_uid == Some(uid)
    }
}

/// Parsed contents of `packages.xml`.
#[derive(Debug, Default)]
pub struct Packages {
    owners: Vec<Owner>,
    /// Certificate index to hex encoded certificate.
    sigs: HashMap<String, String>,
}

impl Packages {
    pub fn parse(xml: &str) -> Result<Self, RegistryError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut packages = Packages::default();
        let mut current: Option<Owner> = None;
        let mut depth = 0usize;
        let mut owner_depth = 0usize;
        let mut sigs_depth: Option<usize> = None;

        loop {
            let event = reader.read_event().map_err(|source| RegistryError::Xml {
                position: reader.buffer_position() as u64,
                source,
            })?;

            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    depth += 1;

                    match e.name().as_ref() {
                        b"package" | b"shared-user" if current.is_none() => {
                            current = Some(parse_owner(e)?);
                            owner_depth = depth;
                        }
                        b"sigs" if current.is_some() && depth == owner_depth + 1 => {
                            sigs_depth = Some(depth);
                        }
                        b"cert" => {
                            let index = attr(e, "index")?;
                            let key = attr(e, "key")?;
                            if let (Some(index), Some(key)) = (&index, key) {
                                packages.sigs.entry(index.clone()).or_insert(key);
                            }
                            if let (Some(owner), Some(sd), Some(index)) =
                                (current.as_mut(), sigs_depth, index)
                            {
                                if depth == sd + 1 {
                                    owner.sig_indexes.push(index);
                                }
                            }
                        }
                        _ => {}
                    }

                    if is_empty {
                        close_element(
                            &mut packages,
                            &mut current,
                            &mut sigs_depth,
                            depth,
                            owner_depth,
                        );
                        depth -= 1;
                    }
                }
                Event::End(_) => {
                    close_element(
                        &mut packages,
                        &mut current,
                        &mut sigs_depth,
                        depth,
                        owner_depth,
                    );
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(packages)
    }

    /// Finds the package owning `uid`, preferring packages over shared users.
    pub fn find_by_uid(&self, uid: u32) -> Option<PackageSignatures> {
        let owner = self
            .owners
            .iter()
            .find(|o| o.kind == OwnerKind::Package && o.owns(uid))
            .or_else(|| {
                self.owners
                    .iter()
                    .find(|o| o.kind == OwnerKind::SharedUser && o.owns(uid))
            })?;

        Some(PackageSignatures {
            package: owner.name.clone(),
            certs: owner
                .sig_indexes
                .iter()
                .map(|index| (index.clone(), self.sigs.get(index).cloned()))
                .collect(),
        })
    }
}

fn close_element(
    packages: &mut Packages,
    current: &mut Option<Owner>,
    sigs_depth: &mut Option<usize>,
    depth: usize,
    owner_depth: usize,
) {
    if *sigs_depth == Some(depth) {
        *sigs_depth = None;
    }
    if current.is_some() && depth == owner_depth {
        if let Some(owner) = current.take() {
            packages.owners.push(owner);
        }
    }
}

fn attr(e: &BytesStart, name: &str) -> Result<Option<String>, RegistryError> {
    for a in e.attributes() {
        let a = a?;
        if a.key.as_ref() == name.as_bytes() {
            let value = a.unescape_value().map_err(|source| RegistryError::Xml {
                position: 0,
                source,
            })?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn uid_attr(e: &BytesStart, name: &'static str) -> Result<Option<u32>, RegistryError> {
    attr(e, name)?
        .map(|value| {
            value.parse().map_err(|_| RegistryError::BadValue {
                element: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                attr: name,
                value,
            })
        })
        .transpose()
}

fn parse_owner(e: &BytesStart) -> Result<Owner, RegistryError> {
    let kind = if e.name().as_ref() == b"package" {
        OwnerKind::Package
    } else {
        OwnerKind::SharedUser
    };

    Ok(Owner {
        kind,
        name: attr(e, "name")?.unwrap_or_default(),
        uid: uid_attr(e, "userId")?,
        shared_uid: uid_attr(e, "sharedUserId")?,
        sig_indexes: Vec::new(),
    })
}

/// Registry that reads a `packages.xml` file on each lookup.
pub struct PackagesXml {
    path: PathBuf,
}

impl PackagesXml {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Packages, RegistryError> {
        let xml = fs::read_to_string(&self.path).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })?;
        Packages::parse(&xml)
    }
}

impl SignatureRegistry for PackagesXml {
    fn signatures_for_uid(&self, uid: u32) -> Result<Option<PackageSignatures>> {
        Ok(self.load()?.find_by_uid(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKAGES: &str = r#"<?xml version='1.0' encoding='utf-8' standalone='yes' ?>
<packages>
    <version sdkVersion="23" databaseVersion="3" fingerprint="test" />
    <package name="com.github.chenxiaolong.dualbootpatcher" codePath="/data/app/dbp-1" userId="10071">
        <sigs count="1">
            <cert index="3" key="abc" />
        </sigs>
        <perms>
            <item name="android.permission.INTERNET" granted="true" flags="0" />
        </perms>
    </package>
    <package name="com.example.other" codePath="/data/app/other-1" userId="10072">
        <sigs count="2">
            <cert index="3" />
            <cert index="9" />
        </sigs>
    </package>
    <package name="com.example.nosigs" codePath="/data/app/nosigs-1" userId="10073" />
    <package name="com.android.settings" codePath="/system/priv-app/Settings" sharedUserId="1000">
        <sigs count="1">
            <cert index="0" key="platform" />
        </sigs>
    </package>
    <shared-user name="android.uid.system" userId="1000">
        <sigs count="1">
            <cert index="0" />
        </sigs>
    </shared-user>
    <shared-user name="android.uid.phone" userId="1001">
        <sigs count="1">
            <cert index="0" />
        </sigs>
    </shared-user>
</packages>
"#;

    #[test]
    fn package_with_inline_key() {
        let pkgs = Packages::parse(PACKAGES).unwrap();
        let sigs = pkgs.find_by_uid(10071).unwrap();
        assert_eq!(sigs.package, "com.github.chenxiaolong.dualbootpatcher");
        assert_eq!(sigs.certs, vec![("3".to_string(), Some("abc".to_string()))]);
    }

    #[test]
    fn index_references_resolve_and_gaps_stay_empty() {
        let pkgs = Packages::parse(PACKAGES).unwrap();
        let sigs = pkgs.find_by_uid(10072).unwrap();
        assert_eq!(
            sigs.certs,
            vec![
                ("3".to_string(), Some("abc".to_string())),
                ("9".to_string(), None),
            ]
        );
    }

    #[test]
    fn package_without_sigs_has_no_certs() {
        let pkgs = Packages::parse(PACKAGES).unwrap();
        let sigs = pkgs.find_by_uid(10073).unwrap();
        assert_eq!(sigs.package, "com.example.nosigs");
        assert!(sigs.certs.is_empty());
    }

    #[test]
    fn shared_uid_prefers_package_then_shared_user() {
        let pkgs = Packages::parse(PACKAGES).unwrap();
        assert_eq!(pkgs.find_by_uid(1000).unwrap().package, "com.android.settings");

        let phone = pkgs.find_by_uid(1001).unwrap();
        assert_eq!(phone.package, "android.uid.phone");
        assert_eq!(
            phone.certs,
            vec![("0".to_string(), Some("platform".to_string()))]
        );
    }

    #[test]
    fn unknown_uid_is_not_found() {
        let pkgs = Packages::parse(PACKAGES).unwrap();
        assert!(pkgs.find_by_uid(12345).is_none());
    }

    #[test]
    fn bad_uid_attribute_is_an_error() {
        let err = Packages::parse(r#"<packages><package name="x" userId="abc" /></packages>"#)
            .unwrap_err();
        assert!(matches!(err, RegistryError::BadValue { attr: "userId", .. }));
    }

    #[test]
    fn registry_reads_file_on_lookup() {
        let file = tempfile::NamedTempFile::new().unwrap();
        fs::write(file.path(), PACKAGES).unwrap();

        let registry = PackagesXml::new(file.path());
        assert!(registry.signatures_for_uid(10071).unwrap().is_some());

        fs::write(file.path(), "<packages></packages>").unwrap();
        assert!(registry.signatures_for_uid(10071).unwrap().is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PackagesXml::new(dir.path().join("packages.xml"));
        assert!(registry.signatures_for_uid(10071).is_err());
    }
}
