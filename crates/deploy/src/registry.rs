//! Persistent address book, one JSON document per network.
//!
//! The document shape is `{ "contracts": { name: address }, "v1": { name: address }, ... }`.
//! `contracts` holds the canonical (proxy-facing) address of each artifact; each `v<N>` table
//! records the backing implementation observed when version N was first recorded.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use alloy_core::primitives::Address;
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RegistryError;

/// A positive version tag, persisted as `v<N>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTag(u32);

impl VersionTag {
    pub const FIRST: VersionTag = VersionTag(1);

    /// Returns `None` for zero.
    pub fn new(version: u32) -> Option<Self> {
        (version > 0).then_some(Self(version))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Returns `None` past `u32::MAX`.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl Default for VersionTag {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for VersionTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('v')
            .ok_or_else(|| format!("version tag must start with 'v', got '{s}'"))?;
        let version: u32 = digits
            .parse()
            .map_err(|_| format!("invalid version tag '{s}'"))?;
        Self::new(version).ok_or_else(|| format!("version tag must be positive, got '{s}'"))
    }
}

impl Serialize for VersionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts `"v2"` as written in registry documents and a bare `2` as written in manifests.
impl<'de> Deserialize<'de> for VersionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagVisitor;

        impl serde::de::Visitor<'_> for TagVisitor {
            type Value = VersionTag;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a positive version such as 2 or \"v2\"")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<VersionTag, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<VersionTag, E> {
                u32::try_from(v)
                    .ok()
                    .and_then(VersionTag::new)
                    .ok_or_else(|| E::custom(format!("invalid version {v}")))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<VersionTag, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("invalid version {v}")))
                    .and_then(|v| self.visit_u64(v))
            }
        }

        deserializer.deserialize_any(TagVisitor)
    }
}

/// In-memory view of one network's registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    /// Canonical address per artifact.
    #[serde(default)]
    pub contracts: BTreeMap<String, Address>,
    /// Backing implementation per version, append-only.
    #[serde(flatten)]
    pub versions: BTreeMap<VersionTag, BTreeMap<String, Address>>,
}

impl Registry {
    pub fn contract(&self, name: &str) -> Option<Address> {
        self.contracts.get(name).copied()
    }

    pub fn implementation(&self, version: VersionTag, name: &str) -> Option<Address> {
        self.versions
            .get(&version)
            .and_then(|table| table.get(name))
            .copied()
    }

    /// Whether any version has been recorded for `name`.
    pub fn has_any_version(&self, name: &str) -> bool {
        self.versions.values().any(|table| table.contains_key(name))
    }

    /// Highest version recorded for `name`.
    pub fn latest_version(&self, name: &str) -> Option<VersionTag> {
        self.versions
            .iter()
            .rev()
            .find(|(_, table)| table.contains_key(name))
            .map(|(version, _)| *version)
    }

    pub fn set_contract(&mut self, name: &str, address: Address) {
        self.contracts.insert(name.to_string(), address);
    }

    /// Record the implementation for `version`, unless one is already on file.
    ///
    /// Returns `true` if a new entry was added.
    pub fn record_implementation(
        &mut self,
        version: VersionTag,
        name: &str,
        implementation: Address,
    ) -> bool {
        let table = self.versions.entry(version).or_default();
        if table.contains_key(name) {
            return false;
        }
        table.insert(name.to_string(), implementation);
        true
    }
}

/// File-backed registry for a single network.
#[derive(Debug, Clone)]
pub struct AddressRegistry {
    network: String,
    path: PathBuf,
}

impl AddressRegistry {
    pub fn new(network: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            network: network.into(),
            path: path.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry, creating and persisting an empty one if the file does not exist.
    pub fn read(&self) -> Result<Registry, RegistryError> {
        if !self.path.exists() {
            let registry = Registry::default();
            self.write(&registry)?;
            tracing::info!(
                network = %self.network,
                path = %self.path.display(),
                "Created empty registry"
            );
            return Ok(registry);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| RegistryError::Read {
            path: self.path.clone(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Atomically replace the persisted document.
    pub fn write(&self, registry: &Registry) -> Result<(), RegistryError> {
        let write_err = |source| RegistryError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        registry
            .serialize(&mut serializer)
            .map_err(|e| write_err(std::io::Error::other(e)))?;
        buf.push(b'\n');

        // the rename must never expose a partially flushed document
        let tmp_path = self.sibling("tmp");
        let mut tmp = File::create(&tmp_path).map_err(write_err)?;
        tmp.write_all(&buf).map_err(write_err)?;
        tmp.sync_all().map_err(write_err)?;
        drop(tmp);
        std::fs::rename(&tmp_path, &self.path).map_err(write_err)?;

        tracing::debug!(network = %self.network, path = %self.path.display(), "Registry written");
        Ok(())
    }

    /// Take the exclusive advisory lock for this network's registry.
    ///
    /// The lock is held until the returned guard is dropped.
    pub fn lock(&self) -> Result<RegistryLock, RegistryError> {
        let lock_path = self.sibling("lock");
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Write {
                path: lock_path.clone(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| RegistryError::Write {
                path: lock_path.clone(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| RegistryError::Locked {
                path: self.path.clone(),
            })?;

        Ok(RegistryLock { file })
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(extension);
        self.path.with_file_name(name)
    }
}

/// Guard for [`AddressRegistry::lock`].
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;
    use tempdir::TempDir;

    const TOKEN: Address = address!("281164a08efe10445772b26d2154fd6f4b90fc08");
    const VAULT: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");
    const VAULT_IMPL: Address = address!("3C44CdDdB6a900fa2b585dd299e03d12FA4293BC");

    #[test]
    fn test_version_tag_parse() {
        assert_eq!("v1".parse::<VersionTag>().unwrap(), VersionTag::FIRST);
        assert_eq!("v12".parse::<VersionTag>().unwrap().get(), 12);
        assert!("v0".parse::<VersionTag>().is_err());
        assert!("1".parse::<VersionTag>().is_err());
        assert!("vx".parse::<VersionTag>().is_err());
        assert_eq!(VersionTag::FIRST.next().unwrap().to_string(), "v2");
    }

    #[test]
    fn test_version_tag_next_stops_at_max() {
        let max = VersionTag::new(u32::MAX).unwrap();
        assert_eq!(max.next(), None);
        assert_eq!(VersionTag::new(u32::MAX - 1).unwrap().next(), Some(max));
    }

    #[test]
    fn test_version_tag_deserialize_forms() {
        let from_str: VersionTag = serde_json::from_str(r#""v3""#).unwrap();
        let from_int: VersionTag = serde_json::from_str("3").unwrap();
        assert_eq!(from_str, from_int);
        assert!(serde_json::from_str::<VersionTag>("0").is_err());
        assert!(serde_json::from_str::<VersionTag>("-1").is_err());
    }

    #[test]
    fn test_read_missing_file_creates_empty_registry() {
        let temp_dir = TempDir::new("rollout-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested/sepolia.json");
        let registry = AddressRegistry::new("sepolia", &path);

        let loaded = registry.read().expect("Missing file should not be an error");

        assert_eq!(loaded, Registry::default());
        assert!(path.exists(), "Empty registry should be persisted");
        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value, serde_json::json!({ "contracts": {} }));
    }

    #[test]
    fn test_read_corrupted_file_is_fatal() {
        let temp_dir = TempDir::new("rollout-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("sepolia.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let result = AddressRegistry::new("sepolia", &path).read();

        assert!(matches!(result, Err(RegistryError::Parse { .. })));
    }

    #[test]
    fn test_read_rejects_invalid_address() {
        let temp_dir = TempDir::new("rollout-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("sepolia.json");
        std::fs::write(&path, r#"{ "contracts": { "Token": "0x1234" } }"#).unwrap();

        let result = AddressRegistry::new("sepolia", &path).read();

        assert!(matches!(result, Err(RegistryError::Parse { .. })));
    }

    #[test]
    fn test_write_and_read_back_versioned_document() {
        let temp_dir = TempDir::new("rollout-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("sepolia.json");
        let registry = AddressRegistry::new("sepolia", &path);

        let mut doc = Registry::default();
        doc.set_contract("Token", TOKEN);
        doc.set_contract("Vault", VAULT);
        doc.record_implementation(VersionTag::FIRST, "Vault", VAULT_IMPL);
        registry.write(&doc).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value["contracts"]["Token"].is_string());
        assert!(value["v1"]["Vault"].is_string());
        assert!(value.get("versions").is_none());

        assert_eq!(registry.read().unwrap(), doc);
        assert!(!temp_dir.path().join("sepolia.json.tmp").exists());
    }

    #[test]
    fn test_write_replaces_previous_document_whole() {
        let temp_dir = TempDir::new("rollout-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("sepolia.json");
        let registry = AddressRegistry::new("sepolia", &path);

        let mut doc = Registry::default();
        doc.set_contract("Token", TOKEN);
        doc.set_contract("Vault", VAULT);
        doc.record_implementation(VersionTag::FIRST, "Vault", VAULT_IMPL);
        registry.write(&doc).unwrap();

        let mut smaller = Registry::default();
        smaller.set_contract("Token", TOKEN);
        registry.write(&smaller).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("}\n"));
        assert_eq!(serde_json::from_str::<Registry>(&content).unwrap(), smaller);
        assert!(!temp_dir.path().join("sepolia.json.tmp").exists());
    }

    #[test]
    fn test_record_implementation_is_append_only() {
        let mut doc = Registry::default();

        assert!(doc.record_implementation(VersionTag::FIRST, "Vault", VAULT_IMPL));
        assert!(!doc.record_implementation(VersionTag::FIRST, "Vault", TOKEN));

        assert_eq!(doc.implementation(VersionTag::FIRST, "Vault"), Some(VAULT_IMPL));
    }

    #[test]
    fn test_latest_version() {
        let mut doc = Registry::default();
        let v2 = VersionTag::FIRST.next().unwrap();
        assert_eq!(doc.latest_version("Vault"), None);

        doc.record_implementation(VersionTag::FIRST, "Vault", VAULT_IMPL);
        doc.record_implementation(v2, "Vault", TOKEN);
        doc.record_implementation(v2.next().unwrap(), "Other", TOKEN);

        assert_eq!(doc.latest_version("Vault"), Some(v2));
        assert!(doc.has_any_version("Vault"));
        assert!(!doc.has_any_version("Token"));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let temp_dir = TempDir::new("rollout-test").expect("Failed to create temp dir");
        let registry = AddressRegistry::new("sepolia", temp_dir.path().join("sepolia.json"));

        let guard = registry.lock().expect("First lock should succeed");
        assert!(matches!(registry.lock(), Err(RegistryError::Locked { .. })));

        drop(guard);
        assert!(registry.lock().is_ok(), "Lock should be released on drop");
    }
}
