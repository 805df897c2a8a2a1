//! State persistence.
//!
//! States are stored as versioned JSON documents with stable key order. A
//! write always goes backup-then-atomic-rename: the prior file is copied to
//! `<path>.backup`, the new document is written to a temporary file in the
//! same directory, and renamed over the target.
//!
//! The manager holds an exclusive OS file lock (RAII guard) across
//! read-modify-write cycles and verifies on write that the file was not
//! modified behind its back.

use super::{
    DeposedKey, InstanceObject, InstanceState, ObjectStatus, OutputValue, ResourceRecord, State,
};
use crate::addrs::{AbsProviderConfig, InstanceKey, ModuleInstance, Resource, ResourceMode};
use crate::value::{Ty, Value, json};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Version of the on-disk document this build writes.
pub const CURRENT_VERSION: u64 = 2;

/// Errors from state persistence.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("timed out waiting for the state lock on {path}")]
    LockTimeout { path: PathBuf },

    #[error("state file {path} changed on disk since it was read")]
    ChecksumMismatch { path: PathBuf },

    #[error("unsupported state file version {0}")]
    UnsupportedVersion(u64),

    #[error("state lineage mismatch: expected {expected}, found {found}")]
    WrongLineage { expected: String, found: String },

    #[error("instance {addr} was written with schema version {stored}, but the provider now offers {current}")]
    SchemaMigrationRequired {
        addr: String,
        stored: u64,
        current: u64,
    },

    #[error("invalid address in state file: {0}")]
    InvalidAddress(String),

    #[error("state file is not valid: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A state snapshot plus its file-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StateFile {
    pub version: u64,
    pub engine_version: String,
    /// Monotonic, incremented on every successful write.
    pub serial: u64,
    /// Random identity fixed when the state was first created; two states
    /// with different lineages are unrelated.
    pub lineage: String,
    pub state: State,
}

impl StateFile {
    /// A brand-new state file with a fresh lineage.
    pub fn new(state: State) -> Self {
        Self {
            version: CURRENT_VERSION,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            state,
        }
    }

    /// The successor of `prior` holding `state`: same lineage, serial
    /// bumped.
    pub fn next(prior: Option<&StateFile>, state: State) -> Self {
        match prior {
            None => Self::new(state),
            Some(p) => Self {
                version: CURRENT_VERSION,
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
                serial: p.serial + 1,
                lineage: p.lineage.clone(),
                state,
            },
        }
    }

    /// Fail unless this file belongs to the expected lineage.
    pub fn ensure_lineage(&self, expected: &str) -> Result<(), StateError> {
        if self.lineage != expected {
            return Err(StateError::WrongLineage {
                expected: expected.to_string(),
                found: self.lineage.clone(),
            });
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, StateError> {
        let doc = StateDoc::from_file(self)?;
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Parse a document, upgrading the previous version in place. Anything
    /// other than the current or previous version is rejected.
    pub fn from_json_str(text: &str) -> Result<Self, StateError> {
        let probe: VersionProbe = serde_json::from_str(text)?;
        match probe.version {
            CURRENT_VERSION => {}
            1 => {}
            other => return Err(StateError::UnsupportedVersion(other)),
        }
        let doc: StateDoc = serde_json::from_str(text)?;
        doc.into_file(probe.version)
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    version: u64,
}

// ---------------------------------------------------------------------------
// Document layout
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct StateDoc {
    version: u64,
    engine_version: String,
    serial: u64,
    lineage: String,
    #[serde(default)]
    outputs: BTreeMap<String, OutputDoc>,
    #[serde(default)]
    resources: Vec<ResourceDoc>,
}

#[derive(Serialize, Deserialize)]
struct OutputDoc {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

#[derive(Serialize, Deserialize)]
struct ResourceDoc {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    module: String,
    mode: ResourceMode,
    #[serde(rename = "type")]
    r#type: String,
    name: String,
    provider: String,
    instances: Vec<InstanceDoc>,
}

#[derive(Serialize, Deserialize)]
struct InstanceDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index_key: Option<InstanceKey>,
    /// Set when this entry is a deposed object rather than the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deposed: Option<String>,
    #[serde(default)]
    status: ObjectStatus,
    #[serde(default)]
    schema_version: u64,
    attributes: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sensitive_attributes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    private: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
}

impl StateDoc {
    fn from_file(file: &StateFile) -> Result<Self, StateError> {
        let mut resources = Vec::new();
        for (module, mstate) in &file.state.modules {
            for (resource, record) in &mstate.resources {
                let mut instances = Vec::new();
                for (key, istate) in &record.instances {
                    if let Some(obj) = &istate.current {
                        instances.push(InstanceDoc::from_object(key.clone(), None, obj)?);
                    }
                    for (dk, obj) in &istate.deposed {
                        instances.push(InstanceDoc::from_object(
                            key.clone(),
                            Some(dk.as_str().to_string()),
                            obj,
                        )?);
                    }
                }
                if instances.is_empty() {
                    continue;
                }
                resources.push(ResourceDoc {
                    module: module.to_string(),
                    mode: resource.mode,
                    r#type: resource.r#type.clone(),
                    name: resource.name.clone(),
                    provider: record.provider.to_string(),
                    instances,
                });
            }
        }

        let outputs = file
            .state
            .root_outputs()
            .iter()
            .map(|(name, out)| {
                Ok((
                    name.clone(),
                    OutputDoc {
                        value: json::to_plain(&strip_unknown(&out.value))?,
                        sensitive: out.sensitive,
                    },
                ))
            })
            .collect::<Result<_, crate::value::ValueError>>()
            .map_err(|e| StateError::InvalidAddress(e.to_string()))?;

        Ok(StateDoc {
            version: CURRENT_VERSION,
            engine_version: file.engine_version.clone(),
            serial: file.serial,
            lineage: file.lineage.clone(),
            outputs,
            resources,
        })
    }

    fn into_file(self, stored_version: u64) -> Result<StateFile, StateError> {
        let mut state = State::new();

        for rdoc in self.resources {
            let module = ModuleInstance::parse(&rdoc.module)
                .map_err(|e| StateError::InvalidAddress(e.to_string()))?;
            let provider = parse_provider(&rdoc.provider, stored_version, &module)?;
            let resource = Resource {
                mode: rdoc.mode,
                r#type: rdoc.r#type,
                name: rdoc.name,
            };
            let record = state
                .modules
                .entry(module)
                .or_default()
                .resources
                .entry(resource)
                .or_insert_with(|| ResourceRecord::new(provider.clone()));
            for idoc in rdoc.instances {
                let istate = record
                    .instances
                    .entry(idoc.index_key.clone())
                    .or_insert_with(InstanceState::default);
                let deposed = idoc.deposed.clone();
                let obj = idoc.into_object()?;
                match deposed {
                    None => istate.current = Some(obj),
                    Some(key) => {
                        istate.deposed.insert(DeposedKey::from(key), obj);
                    }
                }
            }
        }

        if !self.outputs.is_empty() {
            let root = state.modules.entry(ModuleInstance::root()).or_default();
            for (name, odoc) in self.outputs {
                let value = json::from_plain(&odoc.value, &Ty::Dynamic)
                    .map_err(|e| StateError::InvalidAddress(e.to_string()))?;
                root.outputs.insert(
                    name,
                    OutputValue {
                        value,
                        sensitive: odoc.sensitive,
                    },
                );
            }
        }

        Ok(StateFile {
            version: CURRENT_VERSION,
            engine_version: self.engine_version,
            serial: self.serial,
            lineage: self.lineage,
            state,
        })
    }
}

impl InstanceDoc {
    fn from_object(
        key: Option<InstanceKey>,
        deposed: Option<String>,
        obj: &InstanceObject,
    ) -> Result<Self, StateError> {
        let attributes = json::to_plain(&strip_unknown(&obj.value))
            .map_err(|e| StateError::InvalidAddress(e.to_string()))?;
        Ok(InstanceDoc {
            index_key: key,
            deposed,
            status: obj.status,
            schema_version: obj.schema_version,
            attributes,
            sensitive_attributes: obj.sensitive_paths.clone(),
            private: if obj.private.is_empty() {
                String::new()
            } else {
                BASE64.encode(&obj.private)
            },
            dependencies: obj.dependencies.clone(),
        })
    }

    fn into_object(self) -> Result<InstanceObject, StateError> {
        let value = json::from_plain(&self.attributes, &Ty::Dynamic)
            .map_err(|e| StateError::InvalidAddress(e.to_string()))?;
        let private = if self.private.is_empty() {
            Vec::new()
        } else {
            BASE64
                .decode(&self.private)
                .map_err(|e| StateError::InvalidAddress(format!("invalid private data: {e}")))?
        };
        Ok(InstanceObject {
            status: self.status,
            value,
            private,
            dependencies: self.dependencies,
            sensitive_paths: self.sensitive_attributes,
            schema_version: self.schema_version,
        })
    }
}

/// Version 1 recorded providers by bare local name; upgrade to the
/// canonical `provider.NAME` form in the resource's own module.
fn parse_provider(
    raw: &str,
    stored_version: u64,
    module: &ModuleInstance,
) -> Result<AbsProviderConfig, StateError> {
    if stored_version == 1 && !raw.contains("provider.") {
        return Ok(AbsProviderConfig {
            module: module.clone(),
            config: crate::addrs::LocalProviderConfig::default_for(raw),
        });
    }
    AbsProviderConfig::parse(raw).map_err(|e| StateError::InvalidAddress(e.to_string()))
}

/// State never stores unknown markers; a partial object from a failed
/// apply records unresolved attributes as null.
fn strip_unknown(value: &Value) -> Value {
    match value {
        Value::Unknown(ty) => Value::Null(ty.clone()),
        Value::List(t, elems) => {
            Value::List(t.clone(), elems.iter().map(strip_unknown).collect())
        }
        Value::Set(t, elems) => Value::set(t.clone(), elems.iter().map(strip_unknown).collect()),
        Value::Tuple(elems) => Value::Tuple(elems.iter().map(strip_unknown).collect()),
        Value::Map(t, elems) => Value::Map(
            t.clone(),
            elems
                .iter()
                .map(|(k, v)| (k.clone(), strip_unknown(v)))
                .collect(),
        ),
        Value::Object(attrs) => Value::Object(
            attrs
                .iter()
                .map(|(k, v)| (k.clone(), strip_unknown(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Local file manager
// ---------------------------------------------------------------------------

/// An exclusive lock on a state file. Released on drop.
#[derive(Debug)]
pub struct StateLock {
    file: Option<File>,
    path: PathBuf,
}

impl StateLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// Reads and writes state files on the local filesystem.
#[derive(Debug)]
pub struct LocalStateManager {
    path: PathBuf,
    locking: bool,
    lock_timeout: Duration,
    /// Digest of the file content as last read, to detect outside writes.
    last_digest: Mutex<Option<[u8; 32]>>,
}

impl LocalStateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            locking: true,
            lock_timeout: Duration::from_secs(10),
            last_digest: Mutex::new(None),
        }
    }

    pub fn with_locking(mut self, locking: bool) -> Self {
        self.locking = locking;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquire the exclusive lock, retrying until the timeout. Returns
    /// `None` when locking is disabled.
    pub fn lock(&self) -> Result<Option<StateLock>, StateError> {
        if !self.locking {
            return Ok(None);
        }
        let path = self.lock_path();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Some(StateLock {
                        file: Some(file),
                        path,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(StateError::LockTimeout {
                            path: self.path.clone(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the state file; `None` when it does not exist yet.
    pub fn read(&self) -> Result<Option<StateFile>, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.last_digest.lock().expect("digest lock poisoned") = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        *self.last_digest.lock().expect("digest lock poisoned") = Some(digest);
        let text = String::from_utf8_lossy(&bytes);
        Ok(Some(StateFile::from_json_str(&text)?))
    }

    /// Persist a state file: verify nothing changed underneath, back up
    /// the old file, then atomically replace it.
    pub fn write(&self, file: &StateFile) -> Result<(), StateError> {
        if let Some(expected) = *self.last_digest.lock().expect("digest lock poisoned")
            && let Ok(current) = fs::read(&self.path)
        {
            let digest: [u8; 32] = Sha256::digest(&current).into();
            if digest != expected {
                return Err(StateError::ChecksumMismatch {
                    path: self.path.clone(),
                });
            }
        }

        let text = file.to_json_string()?;

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }

        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        fs::write(&tmp, &text)?;
        fs::rename(&tmp, &self.path)?;

        let digest: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        *self.last_digest.lock().expect("digest lock poisoned") = Some(digest);
        log::debug!("wrote state serial {} to {}", file.serial, self.path.display());
        Ok(())
    }

    /// Write a state file to an arbitrary path, bypassing backup and
    /// checksum handling. Used for the errored-state fallback.
    pub fn write_fallback(path: &Path, file: &StateFile) -> Result<(), StateError> {
        fs::write(path, file.to_json_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::LocalProviderConfig;
    use tempfile::TempDir;

    fn sample_state() -> State {
        let mut state = State::new();
        let provider = LocalProviderConfig::default_for("test").absolute(ModuleInstance::root());
        let record = state
            .modules
            .entry(ModuleInstance::root())
            .or_default()
            .resources
            .entry(Resource::managed("test_instance", "web"))
            .or_insert_with(|| ResourceRecord::new(provider));
        let mut obj = InstanceObject::new(Value::Object(BTreeMap::from([
            ("id".to_string(), Value::string("i-1")),
            ("size".to_string(), Value::number_int(4)),
        ])));
        obj.dependencies = vec!["test_instance.base".to_string()];
        obj.private = b"opaque".to_vec();
        record.instances.insert(
            Some(InstanceKey::Int(0)),
            InstanceState {
                current: Some(obj),
                deposed: BTreeMap::new(),
            },
        );
        state
            .modules
            .entry(ModuleInstance::root())
            .or_default()
            .outputs
            .insert(
                "ip".to_string(),
                OutputValue {
                    value: Value::string("10.0.0.1"),
                    sensitive: false,
                },
            );
        state
    }

    #[test]
    fn test_round_trip_is_lossless() {
        let file = StateFile::new(sample_state());
        let text = file.to_json_string().unwrap();
        let parsed = StateFile::from_json_str(&text).unwrap();
        assert_eq!(parsed.lineage, file.lineage);
        assert_eq!(parsed.serial, file.serial);

        let addr = Resource::managed("test_instance", "web")
            .instance(Some(InstanceKey::Int(0)))
            .absolute(ModuleInstance::root());
        let orig = file.state.instance_object(&addr).unwrap();
        let back = parsed.state.instance_object(&addr).unwrap();
        assert_eq!(back.private, orig.private);
        assert_eq!(back.dependencies, orig.dependencies);
        assert_eq!(
            back.value.get_attr("id").unwrap(),
            Value::string("i-1")
        );
        assert_eq!(parsed.state.root_outputs().len(), 1);
    }

    #[test]
    fn test_serial_and_lineage_succession() {
        let first = StateFile::new(State::new());
        let second = StateFile::next(Some(&first), sample_state());
        assert_eq!(second.lineage, first.lineage);
        assert_eq!(second.serial, 1);
        assert!(second.ensure_lineage(&first.lineage).is_ok());
        assert!(matches!(
            second.ensure_lineage("other"),
            Err(StateError::WrongLineage { .. })
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let text = r#"{"version": 99, "engine_version": "", "serial": 0, "lineage": "x"}"#;
        assert!(matches!(
            StateFile::from_json_str(text),
            Err(StateError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_v1_provider_upgrade() {
        let text = r#"{
            "version": 1, "engine_version": "0.1.0", "serial": 3, "lineage": "abc",
            "resources": [{
                "mode": "managed", "type": "test_instance", "name": "web",
                "provider": "test",
                "instances": [{"attributes": {"id": "i-1"}}]
            }]
        }"#;
        let parsed = StateFile::from_json_str(text).unwrap();
        let record = parsed
            .state
            .resource(&Resource::managed("test_instance", "web").absolute(ModuleInstance::root()))
            .unwrap();
        assert_eq!(record.provider.to_string(), "provider.test");
        // Upgraded in memory to the current version.
        assert_eq!(parsed.version, CURRENT_VERSION);
    }

    #[test]
    fn test_manager_write_read_and_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mgr = LocalStateManager::new(&path);

        assert!(mgr.read().unwrap().is_none());

        let first = StateFile::new(sample_state());
        mgr.write(&first).unwrap();
        let read_back = mgr.read().unwrap().unwrap();
        assert_eq!(read_back.lineage, first.lineage);

        // Second write keeps a backup equal to the first content.
        let second = StateFile::next(Some(&first), State::new());
        mgr.write(&second).unwrap();
        let backup = fs::read_to_string(mgr.backup_path()).unwrap();
        let backup_file = StateFile::from_json_str(&backup).unwrap();
        assert_eq!(backup_file.serial, first.serial);
        assert_eq!(mgr.read().unwrap().unwrap().serial, 1);
    }

    #[test]
    fn test_manager_detects_outside_modification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mgr = LocalStateManager::new(&path);
        let first = StateFile::new(State::new());
        mgr.write(&first).unwrap();
        mgr.read().unwrap().unwrap();

        // Someone else rewrites the file.
        fs::write(&path, "{}").unwrap();
        let err = mgr.write(&first).unwrap_err();
        assert!(matches!(err, StateError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_lock_blocks_second_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mgr1 = LocalStateManager::new(&path)
            .with_lock_timeout(Duration::from_millis(100));
        let mgr2 = LocalStateManager::new(&path)
            .with_lock_timeout(Duration::from_millis(100));

        let guard = mgr1.lock().unwrap();
        assert!(guard.is_some());
        assert!(matches!(
            mgr2.lock(),
            Err(StateError::LockTimeout { .. })
        ));
        drop(guard);
        assert!(mgr2.lock().unwrap().is_some());

        let unlocked = LocalStateManager::new(&path).with_locking(false);
        assert!(unlocked.lock().unwrap().is_none());
    }
}
