// src/credentials.rs

//! Decides whether a connecting UID may talk to the daemon.
//!
//! The daemon relies on the package manager for signature checking and only
//! compares the certificates it recorded for the UID's package against a
//! whitelist compiled into the binary. The registry only changes when a
//! package is reinstalled, in which case Android kills the client and the
//! connection goes away with it.

use anyhow::Result;
use log::{debug, error, trace, warn};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::constants;

/// Certificates recorded for the package owning a UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSignatures {
    pub package: String,
    /// One entry per certificate index listed for the package. `None` when
    /// the registry has no certificate for that index.
    pub certs: Vec<(String, Option<String>)>,
}

/// Source of package signatures, keyed by UID.
pub trait SignatureRegistry {
    /// Returns `Ok(None)` when no package owns `uid`.
    fn signatures_for_uid(&self, uid: u32) -> Result<Option<PackageSignatures>>;
}

/// Immutable set of trusted certificates.
#[derive(Debug)]
pub struct Whitelist {
    certs: HashSet<&'static str>,
}

impl Whitelist {
    pub fn new(certs: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            certs: certs.into_iter().collect(),
        }
    }

    /// Parses a comma-separated list, ignoring whitespace and empty items.
    pub fn parse(list: &'static str) -> Self {
        Self::new(list.split(',').map(str::trim).filter(|c| !c.is_empty()))
    }

    pub fn contains(&self, cert: &str) -> bool {
        self.certs.contains(cert)
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }
}

/// The whitelist baked into this build.
pub static VALID_CERTS: LazyLock<Whitelist> =
    LazyLock::new(|| Whitelist::parse(constants::VALID_CERTS));

/// Checks UIDs against the registry and a whitelist.
pub struct CredentialVerifier<R> {
    registry: R,
    whitelist: &'static Whitelist,
}

impl<R: SignatureRegistry> CredentialVerifier<R> {
    pub fn new(registry: R, whitelist: &'static Whitelist) -> Self {
        Self {
            registry,
            whitelist,
        }
    }

    /// Returns whether `uid` belongs to a package signed with a whitelisted
    /// certificate. Every failure resolves to `false`.
    pub fn verify(&self, uid: u32) -> bool {
        let pkg = match self.registry.signatures_for_uid(uid) {
            Ok(Some(pkg)) => pkg,
            Ok(None) => {
                error!("Failed to find package for UID {uid}");
                return false;
            }
            Err(e) => {
                error!("Failed to load package registry: {e:?}");
                return false;
            }
        };

        debug!("{} has {} signatures", pkg.package, pkg.certs.len());

        for (index, cert) in &pkg.certs {
            let Some(cert) = cert else {
                warn!("Signature index {index} has no key");
                continue;
            };

            if self.whitelist.contains(cert) {
                trace!("{} matches whitelisted signatures", pkg.package);
                return true;
            }
        }

        error!("{} does not match whitelisted signatures", pkg.package);
        false
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory registry for tests.
    #[derive(Default)]
    pub struct FakeRegistry {
        pub packages: HashMap<u32, PackageSignatures>,
        pub broken: bool,
    }

    impl FakeRegistry {
        pub fn with(mut self, uid: u32, package: &str, certs: &[(&str, Option<&str>)]) -> Self {
            self.packages.insert(
                uid,
                PackageSignatures {
                    package: package.to_string(),
                    certs: certs
                        .iter()
                        .map(|(i, c)| (i.to_string(), c.map(str::to_string)))
                        .collect(),
                },
            );
            self
        }
    }

    impl SignatureRegistry for FakeRegistry {
        fn signatures_for_uid(&self, uid: u32) -> Result<Option<PackageSignatures>> {
            if self.broken {
                anyhow::bail!("registry unavailable");
            }
            Ok(self.packages.get(&uid).cloned())
        }
    }

    pub static TEST_WHITELIST: LazyLock<Whitelist> =
        LazyLock::new(|| Whitelist::new(["abc", "def"]));

    fn verifier(registry: FakeRegistry) -> CredentialVerifier<FakeRegistry> {
        CredentialVerifier::new(registry, &TEST_WHITELIST)
    }

    #[test]
    fn whitelisted_signature_is_allowed() {
        let v = verifier(FakeRegistry::default().with(10001, "app.one", &[("0", Some("abc"))]));
        assert!(v.verify(10001));
    }

    #[test]
    fn any_matching_signature_is_enough() {
        let v = verifier(FakeRegistry::default().with(
            10002,
            "app.two",
            &[("0", Some("zzz")), ("1", Some("def"))],
        ));
        assert!(v.verify(10002));
    }

    #[test]
    fn unknown_uid_is_denied() {
        let v = verifier(FakeRegistry::default().with(10001, "app.one", &[("0", Some("abc"))]));
        assert!(!v.verify(10002));
    }

    #[test]
    fn disjoint_or_empty_signatures_are_denied() {
        let v = verifier(
            FakeRegistry::default()
                .with(10003, "app.three", &[("0", Some("xyz"))])
                .with(10004, "app.four", &[]),
        );
        assert!(!v.verify(10003));
        assert!(!v.verify(10004));
    }

    #[test]
    fn missing_key_is_skipped_not_trusted() {
        let v = verifier(FakeRegistry::default().with(
            10005,
            "app.five",
            &[("7", None), ("8", Some("abc"))],
        ));
        assert!(v.verify(10005));

        let v = verifier(FakeRegistry::default().with(10006, "app.six", &[("7", None)]));
        assert!(!v.verify(10006));
    }

    #[test]
    fn registry_failure_is_denied() {
        let registry = FakeRegistry {
            broken: true,
            ..Default::default()
        };
        assert!(!verifier(registry).verify(10001));
    }

    #[test]
    fn whitelist_parsing_skips_blanks() {
        let list = Whitelist::parse(" abc , ,def,");
        assert_eq!(list.len(), 2);
        assert!(list.contains("abc"));
        assert!(list.contains("def"));
        assert!(!list.contains(""));
        assert!(Whitelist::parse("").is_empty());
    }
}
