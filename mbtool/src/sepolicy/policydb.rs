// src/sepolicy/policydb.rs

//! Reader for the binary kernel policy format.
//!
//! Only what is needed to add allow rules is decoded: the symbol tables that
//! map type, class and permission names to values, and the type enforcement
//! access vector table (avtab). The avtab sits directly after the symbol
//! tables, so a patched policy is the original prefix, a re-encoded avtab,
//! and the original suffix.

use std::collections::HashMap;
use std::ops::Range;

use super::PolicyError;

pub const POLICYDB_MAGIC: u32 = 0xf97c_ff8c;
pub const POLICYDB_STRING: &[u8] = b"SE Linux";

pub const POLICYDB_VERSION_AVTAB: u32 = 20;
pub const POLICYDB_VERSION_POLCAP: u32 = 22;
pub const POLICYDB_VERSION_PERMISSIVE: u32 = 23;
pub const POLICYDB_VERSION_BOUNDARY: u32 = 24;
pub const POLICYDB_VERSION_NEW_OBJECT_DEFAULTS: u32 = 27;
pub const POLICYDB_VERSION_DEFAULT_TYPE: u32 = 28;
pub const POLICYDB_VERSION_CONSTRAINT_NAMES: u32 = 29;
pub const POLICYDB_VERSION_XPERMS_IOCTL: u32 = 30;
pub const POLICYDB_VERSION_MAX: u32 = 34;

const SYM_COMMONS: usize = 0;
const SYM_CLASSES: usize = 1;
const SYM_ROLES: usize = 2;
const SYM_TYPES: usize = 3;
const SYM_USERS: usize = 4;
const SYM_BOOLS: usize = 5;
const SYM_LEVELS: usize = 6;
const SYM_CATS: usize = 7;
const SYM_NUM: usize = 8;

const EBITMAP_MAPSIZE: u32 = 64;

const CEXPR_NAMES: u32 = 5;

pub const AVTAB_ALLOWED: u16 = 0x0001;
pub const AVTAB_XPERMS: u16 = 0x0700;

/// Access vector table key plus its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvtabEntry {
    pub source_type: u16,
    pub target_type: u16,
    pub target_class: u16,
    pub specified: u16,
    pub datum: AvtabDatum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvtabDatum {
    Data(u32),
    Xperms {
        specified: u8,
        driver: u8,
        perms: [u32; 8],
    },
}

#[derive(Debug, Default)]
pub struct ClassDatum {
    pub value: u32,
    pub common: Option<String>,
    pub perms: HashMap<String, u32>,
}

/// A loaded kernel policy.
#[derive(Debug)]
pub struct PolicyDb {
    raw: Vec<u8>,
    pub version: u32,
    pub mls: bool,
    commons: HashMap<String, HashMap<String, u32>>,
    classes: HashMap<String, ClassDatum>,
    types: HashMap<String, u32>,
    avtab_range: Range<usize>,
    pub avtab: Vec<AvtabEntry>,
}

/// Little-endian cursor over the policy image.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], PolicyError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(PolicyError::Truncated { offset: self.pos })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, PolicyError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PolicyError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, PolicyError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32s<const N: usize>(&mut self) -> Result<[u32; N], PolicyError> {
        let mut out = [0u32; N];
        for v in &mut out {
            *v = self.u32()?;
        }
        Ok(out)
    }

    fn string(&mut self, len: u32) -> Result<String, PolicyError> {
        let offset = self.pos;
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PolicyError::Malformed {
            offset,
            what: "non UTF-8 symbol name",
        })
    }

    fn skip_ebitmap(&mut self) -> Result<(), PolicyError> {
        let offset = self.pos;
        let [mapsize, _highbit, count] = self.u32s::<3>()?;
        if mapsize != EBITMAP_MAPSIZE {
            return Err(PolicyError::Malformed {
                offset,
                what: "ebitmap map size",
            });
        }
        // Each node is a u32 start bit and a u64 map.
        let len = (count as usize)
            .checked_mul(12)
            .ok_or(PolicyError::Malformed {
                offset,
                what: "ebitmap node count",
            })?;
        self.take(len)?;
        Ok(())
    }

    fn skip_mls_level(&mut self) -> Result<(), PolicyError> {
        self.u32()?;
        self.skip_ebitmap()
    }

    fn skip_mls_range(&mut self) -> Result<(), PolicyError> {
        let offset = self.pos;
        let items = self.u32()?;
        if !(1..=2).contains(&items) {
            return Err(PolicyError::Malformed {
                offset,
                what: "MLS range item count",
            });
        }
        self.take(items as usize * 4)?;
        self.skip_ebitmap()?;
        if items > 1 {
            self.skip_ebitmap()?;
        }
        Ok(())
    }
}

impl PolicyDb {
    pub fn parse(raw: Vec<u8>) -> Result<Self, PolicyError> {
        let mut r = Reader::new(&raw);

        let magic = r.u32()?;
        if magic != POLICYDB_MAGIC {
            return Err(PolicyError::BadMagic(magic));
        }
        let len = r.u32()?;
        if r.take(len as usize)? != POLICYDB_STRING {
            return Err(PolicyError::Malformed {
                offset: 4,
                what: "policy target string",
            });
        }

        let [version, config, sym_num, _ocon_num] = r.u32s::<4>()?;
        if !(POLICYDB_VERSION_AVTAB..=POLICYDB_VERSION_MAX).contains(&version) {
            return Err(PolicyError::UnsupportedVersion(version));
        }
        if sym_num as usize > SYM_NUM {
            return Err(PolicyError::Malformed {
                offset: r.pos - 8,
                what: "symbol table count",
            });
        }

        if version >= POLICYDB_VERSION_POLCAP {
            r.skip_ebitmap()?;
        }
        if version >= POLICYDB_VERSION_PERMISSIVE {
            r.skip_ebitmap()?;
        }

        let mut db = PolicyDb {
            raw: Vec::new(),
            version,
            mls: config & 1 != 0,
            commons: HashMap::new(),
            classes: HashMap::new(),
            types: HashMap::new(),
            avtab_range: 0..0,
            avtab: Vec::new(),
        };

        for sym in 0..sym_num as usize {
            let [_nprim, nel] = r.u32s::<2>()?;
            for _ in 0..nel {
                match sym {
                    SYM_COMMONS => db.read_common(&mut r)?,
                    SYM_CLASSES => db.read_class(&mut r)?,
                    SYM_ROLES => read_role(&mut r, version)?,
                    SYM_TYPES => db.read_type(&mut r)?,
                    SYM_USERS => read_user(&mut r, version)?,
                    SYM_BOOLS => read_bool(&mut r)?,
                    SYM_LEVELS => read_level(&mut r)?,
                    SYM_CATS => read_cat(&mut r)?,
                    _ => unreachable!("symbol table count checked above"),
                }
            }
        }

        let avtab_start = r.pos;
        db.avtab = read_avtab(&mut r, version)?;
        db.avtab_range = avtab_start..r.pos;
        db.raw = raw;

        Ok(db)
    }

    fn read_common(&mut self, r: &mut Reader) -> Result<(), PolicyError> {
        let [len, _value, _nprim, nel] = r.u32s::<4>()?;
        let key = r.string(len)?;
        let perms = read_perms(r, nel)?;
        self.commons.insert(key, perms);
        Ok(())
    }

    fn read_class(&mut self, r: &mut Reader) -> Result<(), PolicyError> {
        let [len, len2, value, _nprim, nel, ncons] = r.u32s::<6>()?;
        let key = r.string(len)?;
        let common = if len2 > 0 {
            Some(r.string(len2)?)
        } else {
            None
        };
        let perms = read_perms(r, nel)?;

        skip_constraints(r, ncons, self.version)?;
        // validatetrans exists in every supported version.
        let ncons = r.u32()?;
        skip_constraints(r, ncons, self.version)?;

        if self.version >= POLICYDB_VERSION_NEW_OBJECT_DEFAULTS {
            r.u32s::<3>()?;
        }
        if self.version >= POLICYDB_VERSION_DEFAULT_TYPE {
            r.u32()?;
        }

        self.classes.insert(
            key,
            ClassDatum {
                value,
                common,
                perms,
            },
        );
        Ok(())
    }

    fn read_type(&mut self, r: &mut Reader) -> Result<(), PolicyError> {
        let (len, value) = if self.version >= POLICYDB_VERSION_BOUNDARY {
            let [len, value, _properties, _bounds] = r.u32s::<4>()?;
            (len, value)
        } else {
            let [len, value, _primary] = r.u32s::<3>()?;
            (len, value)
        };
        // Aliases carry the value of the type they alias.
        let key = r.string(len)?;
        self.types.insert(key, value);
        Ok(())
    }

    pub fn type_value(&self, name: &str) -> Option<u32> {
        self.types.get(name).copied()
    }

    pub fn class(&self, name: &str) -> Option<&ClassDatum> {
        self.classes.get(name)
    }

    /// Looks up a permission of `class`, falling back to its common.
    pub fn perm_value(&self, class: &ClassDatum, name: &str) -> Option<u32> {
        class.perms.get(name).copied().or_else(|| {
            class
                .common
                .as_ref()
                .and_then(|c| self.commons.get(c))
                .and_then(|perms| perms.get(name).copied())
        })
    }

    /// Byte range of the avtab in the loaded image.
    #[cfg(test)]
    pub fn avtab_range(&self) -> Range<usize> {
        self.avtab_range.clone()
    }

    /// Re-emits the policy with the current avtab.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.raw.len() + 16);
        out.extend_from_slice(&self.raw[..self.avtab_range.start]);
        write_avtab(&mut out, &self.avtab);
        out.extend_from_slice(&self.raw[self.avtab_range.end..]);
        out
    }
}

fn read_perms(r: &mut Reader, nel: u32) -> Result<HashMap<String, u32>, PolicyError> {
    let mut perms = HashMap::new();
    for _ in 0..nel {
        let [len, value] = r.u32s::<2>()?;
        let key = r.string(len)?;
        perms.insert(key, value);
    }
    Ok(perms)
}

fn skip_constraints(r: &mut Reader, ncons: u32, version: u32) -> Result<(), PolicyError> {
    for _ in 0..ncons {
        let [_permissions, nexpr] = r.u32s::<2>()?;
        for _ in 0..nexpr {
            let [expr_type, _attr, _op] = r.u32s::<3>()?;
            if expr_type == CEXPR_NAMES {
                r.skip_ebitmap()?;
                if version >= POLICYDB_VERSION_CONSTRAINT_NAMES {
                    // type_set: types, negset, flags
                    r.skip_ebitmap()?;
                    r.skip_ebitmap()?;
                    r.u32()?;
                }
            }
        }
    }
    Ok(())
}

fn read_role(r: &mut Reader, version: u32) -> Result<(), PolicyError> {
    let len = if version >= POLICYDB_VERSION_BOUNDARY {
        r.u32s::<3>()?[0]
    } else {
        r.u32s::<2>()?[0]
    };
    r.take(len as usize)?;
    // dominates, types
    r.skip_ebitmap()?;
    r.skip_ebitmap()
}

fn read_user(r: &mut Reader, version: u32) -> Result<(), PolicyError> {
    let len = if version >= POLICYDB_VERSION_BOUNDARY {
        r.u32s::<3>()?[0]
    } else {
        r.u32s::<2>()?[0]
    };
    r.take(len as usize)?;
    r.skip_ebitmap()?;
    // Present whether or not the policy enables MLS.
    r.skip_mls_range()?;
    r.skip_mls_level()
}

fn read_bool(r: &mut Reader) -> Result<(), PolicyError> {
    let [_value, _state, len] = r.u32s::<3>()?;
    r.take(len as usize)?;
    Ok(())
}

fn read_level(r: &mut Reader) -> Result<(), PolicyError> {
    let [len, _isalias] = r.u32s::<2>()?;
    r.take(len as usize)?;
    r.skip_mls_level()
}

fn read_cat(r: &mut Reader) -> Result<(), PolicyError> {
    let [len, _value, _isalias] = r.u32s::<3>()?;
    r.take(len as usize)?;
    Ok(())
}

fn read_avtab(r: &mut Reader, version: u32) -> Result<Vec<AvtabEntry>, PolicyError> {
    let nel = r.u32()?;
    let mut entries = Vec::with_capacity(nel.min(1 << 20) as usize);

    for _ in 0..nel {
        let offset = r.pos;
        let source_type = r.u16()?;
        let target_type = r.u16()?;
        let target_class = r.u16()?;
        let specified = r.u16()?;

        let datum = if specified & AVTAB_XPERMS != 0 {
            if version < POLICYDB_VERSION_XPERMS_IOCTL {
                return Err(PolicyError::Malformed {
                    offset,
                    what: "extended permissions before version 30",
                });
            }
            let specified = r.u8()?;
            let driver = r.u8()?;
            let perms = r.u32s::<8>()?;
            AvtabDatum::Xperms {
                specified,
                driver,
                perms,
            }
        } else {
            AvtabDatum::Data(r.u32()?)
        };

        entries.push(AvtabEntry {
            source_type,
            target_type,
            target_class,
            specified,
            datum,
        });
    }

    Ok(entries)
}

fn write_avtab(out: &mut Vec<u8>, entries: &[AvtabEntry]) {
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.source_type.to_le_bytes());
        out.extend_from_slice(&e.target_type.to_le_bytes());
        out.extend_from_slice(&e.target_class.to_le_bytes());
        out.extend_from_slice(&e.specified.to_le_bytes());
        match &e.datum {
            AvtabDatum::Data(data) => out.extend_from_slice(&data.to_le_bytes()),
            AvtabDatum::Xperms {
                specified,
                driver,
                perms,
            } => {
                out.push(*specified);
                out.push(*driver);
                for p in perms {
                    out.extend_from_slice(&p.to_le_bytes());
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_policy::*;
    use super::*;

    #[test]
    fn parses_symbols_and_avtab_across_versions() {
        for version in [26, 28, 30, 31, 33] {
            let entry = allow(TYPE_KERNEL, TYPE_INIT, CLASS_UNIX_STREAM_SOCKET, PERM_READ);
            let db = PolicyDb::parse(build(version, &[entry.clone()])).unwrap();

            assert_eq!(db.version, version);
            assert!(db.mls);
            assert_eq!(db.type_value("init"), Some(TYPE_INIT as u32));
            assert_eq!(db.type_value("init_alias"), Some(TYPE_INIT as u32));
            assert_eq!(
                db.type_value("untrusted_app"),
                Some(TYPE_UNTRUSTED_APP as u32)
            );

            let class = db.class("unix_stream_socket").unwrap();
            assert_eq!(class.value, CLASS_UNIX_STREAM_SOCKET as u32);
            assert_eq!(db.perm_value(class, "connectto"), Some(3));
            assert_eq!(db.perm_value(class, "read"), Some(1));
            assert_eq!(db.perm_value(class, "bogus"), None);

            assert_eq!(db.avtab, vec![entry]);
        }
    }

    #[test]
    fn unmodified_policy_round_trips_byte_for_byte() {
        let raw = build(30, &[allow(TYPE_KERNEL, TYPE_INIT, 1, PERM_READ)]);
        let db = PolicyDb::parse(raw.clone()).unwrap();
        assert_eq!(db.to_bytes(), raw);
        assert!(raw[db.avtab_range().end..].ends_with(TRAILER));
    }

    #[test]
    fn extended_permission_entries_are_kept() {
        let xperm = AvtabEntry {
            source_type: TYPE_UNTRUSTED_APP,
            target_type: TYPE_INIT,
            target_class: CLASS_UNIX_STREAM_SOCKET,
            specified: 0x0100,
            datum: AvtabDatum::Xperms {
                specified: 1,
                driver: 0x89,
                perms: [0, 1, 2, 3, 4, 5, 6, 0xffff_ffff],
            },
        };
        let raw = build(30, &[xperm.clone()]);
        let db = PolicyDb::parse(raw.clone()).unwrap();
        assert_eq!(db.avtab, vec![xperm]);
        assert_eq!(db.to_bytes(), raw);
    }

    #[test]
    fn extended_permissions_need_version_30() {
        let mut xperm = allow(TYPE_UNTRUSTED_APP, TYPE_INIT, 1, 0);
        xperm.specified = 0x0100;
        xperm.datum = AvtabDatum::Xperms {
            specified: 1,
            driver: 0,
            perms: [0; 8],
        };
        let err = PolicyDb::parse(build(29, &[xperm])).unwrap_err();
        assert!(matches!(err, PolicyError::Malformed { .. }));
    }

    #[test]
    fn huge_ebitmap_node_count_is_rejected() {
        let mut raw = build(30, &[]);
        // Node count of the policy capability bitmap.
        raw[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            PolicyDb::parse(raw),
            Err(PolicyError::Truncated { .. } | PolicyError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = build(30, &[]);
        raw[0] ^= 0xff;
        assert!(matches!(
            PolicyDb::parse(raw),
            Err(PolicyError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_unsupported_versions() {
        let mut raw = build(30, &[]);
        raw[16..20].copy_from_slice(&19u32.to_le_bytes());
        assert!(matches!(
            PolicyDb::parse(raw),
            Err(PolicyError::UnsupportedVersion(19))
        ));
    }

    #[test]
    fn rejects_truncated_images() {
        let raw = build(30, &[allow(TYPE_KERNEL, TYPE_INIT, 1, PERM_READ)]);
        let db = PolicyDb::parse(raw.clone()).unwrap();
        let cut = raw[..db.avtab_range().end - 2].to_vec();
        assert!(matches!(
            PolicyDb::parse(cut),
            Err(PolicyError::Truncated { .. })
        ));
    }
}
