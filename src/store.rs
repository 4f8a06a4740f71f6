// boltd - Thunderbolt/USB4 device authorization daemon
//
// On-disk store: devices/<uid>, keys/<uid>, domains/<uid> and a top-level
// config file, all under one root directory. See spec.md §4.4 and §6
// "Persisted state layout".

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::key::Key;
use crate::types::{KeyState, Policy, Uid};

const DEVICES_DIR: &str = "devices";
const KEYS_DIR: &str = "keys";
const DOMAINS_DIR: &str = "domains";
const CONFIG_FILE: &str = "config";

/// A stored device record: the mutable fields the daemon rewrites on
/// every enrollment, plus whatever key state accompanies it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDevice {
    pub uid: Uid,
    pub name: String,
    pub vendor: String,
    pub policy: Policy,
    pub label: Option<String>,
}

/// Root directory for all persisted daemon state.
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens (and creates, if missing) the store rooted at `root`.
    /// Failure to create the root is one of the three fatal startup
    /// conditions in spec.md §7.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join(DEVICES_DIR)
    }

    fn keys_dir(&self) -> PathBuf {
        self.root.join(KEYS_DIR)
    }

    fn domains_dir(&self) -> PathBuf {
        self.root.join(DOMAINS_DIR)
    }

    fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Atomically writes `contents` to `path`, creating parent
    /// directories as needed. Shared by every subtree so crash safety is
    /// implemented exactly once.
    pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(&tmp)?;
            f.write_all(contents.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Lists every stored device uid, excluding dot-files.
    pub fn list_uids(&self) -> Result<Vec<Uid>> {
        let dir = self.devices_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut uids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            uids.push(Uid::new(name.into_owned()));
        }
        uids.sort();
        Ok(uids)
    }

    /// Writes both the device record and, if provided, the key material
    /// for `uid`. Both files are written atomically; this is not a single
    /// cross-file transaction (spec.md does not require one), but each
    /// individual file update is crash-safe.
    pub fn put_device(
        &self,
        uid: &Uid,
        name: &str,
        vendor: &str,
        policy: Policy,
        label: Option<&str>,
        key: Option<&Key>,
    ) -> Result<()> {
        let mut kf = crate::keyfile::KeyFile::new();
        kf.set("device", "name", name);
        kf.set("device", "vendor", vendor);
        kf.set("user", "policy", policy.to_string());
        if let Some(label) = label {
            kf.set("user", "label", label);
        }

        Self::write_atomic(&self.devices_dir().join(uid.as_str()), &kf.to_string())?;

        if let Some(key) = key {
            self.save_key(uid, key)?;
        }

        Ok(())
    }

    pub fn get_device(&self, uid: &Uid) -> Result<StoredDevice> {
        let path = self.devices_dir().join(uid.as_str());
        let text = fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("device {uid} not stored")))?;
        let kf = crate::keyfile::KeyFile::parse(&text);

        Ok(StoredDevice {
            uid: uid.clone(),
            name: kf.get("device", "name").unwrap_or_default().to_string(),
            vendor: kf.get("device", "vendor").unwrap_or_default().to_string(),
            policy: kf
                .get("user", "policy")
                .map(Policy::from)
                .unwrap_or_default(),
            label: kf.get("user", "label").map(str::to_string),
        })
    }

    pub fn delete_device(&self, uid: &Uid) -> Result<()> {
        let path = self.devices_dir().join(uid.as_str());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// State-only check: does a key file exist for `uid`. Does not read
    /// the key's contents.
    pub fn have_key(&self, uid: &Uid) -> bool {
        self.keys_dir().join(uid.as_str()).exists()
    }

    pub fn key_state(&self, uid: &Uid) -> KeyState {
        if self.have_key(uid) {
            KeyState::Have
        } else {
            KeyState::Missing
        }
    }

    pub fn get_key(&self, uid: &Uid) -> Result<Key> {
        let path = self.keys_dir().join(uid.as_str());
        if !path.exists() {
            return Err(Error::NoKey { uid: uid.clone() });
        }
        Key::load(uid, &path)
    }

    pub fn save_key(&self, uid: &Uid, key: &Key) -> Result<()> {
        key.save(&self.keys_dir().join(uid.as_str()))
    }

    pub fn delete_key(&self, uid: &Uid) -> Result<()> {
        let path = self.keys_dir().join(uid.as_str());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists a domain's boot-ACL, keyed by the domain's own uid.
    pub fn put_domain_bootacl(&self, uid: &Uid, bootacl: &[Option<Uid>]) -> Result<()> {
        let mut kf = crate::keyfile::KeyFile::new();
        let joined = bootacl
            .iter()
            .map(|slot| slot.as_ref().map(Uid::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(";");
        kf.set("domain", "bootacl", joined);
        Self::write_atomic(&self.domains_dir().join(uid.as_str()), &kf.to_string())
    }

    pub fn get_domain_bootacl(&self, uid: &Uid) -> Result<Vec<Option<Uid>>> {
        let path = self.domains_dir().join(uid.as_str());
        let text = fs::read_to_string(&path)
            .map_err(|_| Error::NotFound(format!("domain {uid} not stored")))?;
        let kf = crate::keyfile::KeyFile::parse(&text);
        let joined = kf.get("domain", "bootacl").unwrap_or_default();
        Ok(joined
            .split(';')
            .map(|s| if s.is_empty() { None } else { Some(Uid::new(s)) })
            .collect())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_text(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.config_path()) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_config_text(&self, text: &str) -> Result<()> {
        Self::write_atomic(&self.config_path(), text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_device_round_trips() {
        let (_dir, store) = open_tmp();
        let uid = Uid::new("fbc83890-e9bf-45e5-a777-b3728490989c");

        store
            .put_device(&uid, "Laptop", "GNOME.org", Policy::Auto, None, None)
            .unwrap();

        let got = store.get_device(&uid).unwrap();
        assert_eq!(got.uid, uid);
        assert_eq!(got.name, "Laptop");
        assert_eq!(got.vendor, "GNOME.org");
        assert_eq!(got.policy, Policy::Auto);
    }

    #[test]
    fn put_device_with_key_also_writes_key_file() {
        let (_dir, store) = open_tmp();
        let uid = Uid::new("some-uid");
        let (key, _) = Key::generate().unwrap();
        let hex = key.to_hex();

        store
            .put_device(&uid, "Dock", "Acme", Policy::Manual, None, Some(&key))
            .unwrap();

        assert!(store.have_key(&uid));
        assert_eq!(store.get_key(&uid).unwrap().to_hex(), hex);
    }

    #[test]
    fn get_device_missing_uid_is_not_found() {
        let (_dir, store) = open_tmp();
        let err = store.get_device(&Uid::new("missing")).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn list_uids_excludes_dotfiles() {
        let (_dir, store) = open_tmp();
        store
            .put_device(&Uid::new("a"), "A", "V", Policy::Default, None, None)
            .unwrap();
        fs::write(store.devices_dir().join(".hidden"), "junk").unwrap();

        let uids = store.list_uids().unwrap();
        assert_eq!(uids, vec![Uid::new("a")]);
    }

    #[test]
    fn bootacl_round_trips_with_empty_slots() {
        let (_dir, store) = open_tmp();
        let domain_uid = Uid::new("domain0");
        let acl = vec![None, Some(Uid::new("dev-a")), None];

        store.put_domain_bootacl(&domain_uid, &acl).unwrap();
        assert_eq!(store.get_domain_bootacl(&domain_uid).unwrap(), acl);
    }
}
