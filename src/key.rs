// boltd - Thunderbolt/USB4 device authorization daemon
//
// Key material: generation, on-disk persistence and the kernel write
// sequence. See spec.md §4.3.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::libc;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::types::{SecurityLevel, Uid};

const KEY_BYTES: usize = 32;
const KEY_HEX_LEN: usize = KEY_BYTES * 2;

/// Entropy source a [`Key`] was generated from. Mirrors the teacher's
/// layered approach to sourcing randomness (see `tbauth.rs::gen_key`),
/// promoted to an explicit, fallible, three-tier strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeySource {
    Getrandom,
    UrandomDevice,
    ThreadRng,
}

/// 32 bytes of key material. Zeroized on drop; never `Clone` so that a
/// copy can't outlive the original and escape the zeroing.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Key {
    bytes: [u8; KEY_BYTES],
    /// `true` if generated this process and never written to the kernel.
    /// Not persisted: a key loaded from disk is never fresh.
    #[zeroize(skip)]
    fresh: bool,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("bytes", &"<redacted>")
            .field("fresh", &self.fresh)
            .finish()
    }
}

impl Key {
    /// Generates 32 bytes of entropy, trying the kernel `getrandom(2)`
    /// syscall, then a blocking read of `/dev/urandom`, then finally an
    /// in-process PRNG.
    pub fn generate() -> Result<(Self, KeySource)> {
        let mut bytes = [0u8; KEY_BYTES];

        if let Ok(()) = Self::fill_getrandom(&mut bytes) {
            return Ok((Self { bytes, fresh: true }, KeySource::Getrandom));
        }

        if let Ok(()) = Self::fill_urandom(&mut bytes) {
            return Ok((Self { bytes, fresh: true }, KeySource::UrandomDevice));
        }

        rand::thread_rng().fill_bytes(&mut bytes);
        Ok((Self { bytes, fresh: true }, KeySource::ThreadRng))
    }

    fn fill_getrandom(buf: &mut [u8; KEY_BYTES]) -> Result<()> {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_getrandom,
                buf.as_mut_ptr(),
                buf.len(),
                0 as libc::c_uint,
            )
        };
        if ret == buf.len() as i64 {
            Ok(())
        } else {
            Err(Errno::last().into())
        }
    }

    fn fill_urandom(buf: &mut [u8; KEY_BYTES]) -> Result<()> {
        let mut f = fs::File::open("/dev/urandom")?;
        f.read_exact(buf)?;
        Ok(())
    }

    /// `true` if this key was generated this process and never written.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(KEY_HEX_LEN);
        for b in self.bytes {
            use std::fmt::Write as _;
            write!(s, "{b:02x}").expect("writing to String cannot fail");
        }
        s
    }

    /// Parses a 64-character lowercase hex string. Errors with
    /// [`Error::BadKey`] unless the length matches exactly. A key loaded
    /// this way is never [`fresh`](Self::is_fresh).
    pub fn from_hex(uid: &Uid, s: &str) -> Result<Self> {
        let s = s.trim_end();
        if s.len() != KEY_HEX_LEN {
            return Err(Error::BadKey {
                uid: uid.clone(),
                reason: format!("expected {KEY_HEX_LEN} hex chars, got {}", s.len()),
            });
        }

        let mut bytes = [0u8; KEY_BYTES];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            let byte_str = &s[i * 2..i * 2 + 2];
            *chunk = u8::from_str_radix(byte_str, 16).map_err(|_| Error::BadKey {
                uid: uid.clone(),
                reason: "not valid hex".into(),
            })?;
        }

        Ok(Self {
            bytes,
            fresh: false,
        })
    }

    /// Writes the 64-char hex form to `path` with mode `0600`, creating
    /// parent directories as needed. Uses write-temp-then-rename for
    /// crash safety, matching the rest of the store's file I/O.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            f.write_all(self.to_hex().as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a key from `path`. Requires exactly 64 hex characters.
    pub fn load(uid: &Uid, path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_hex(uid, &contents)
    }

    /// Writes this key's hex form to the kernel's `key` sysfs attribute
    /// and returns the [`SecurityLevel`] achieved:
    ///
    /// - if the key was [`fresh`](Self::is_fresh), we just installed a new
    ///   secret, so the achieved level is [`SecurityLevel::User`];
    /// - otherwise we proved we still hold a previously-installed secret,
    ///   so the achieved level is [`SecurityLevel::Secure`].
    pub fn write_to_kernel(&self, uid: &Uid, device: &udev::Device) -> Result<SecurityLevel> {
        device
            .set_attribute_value("key", self.to_hex())
            .map_err(|e| match e.raw_os_error().map(Errno::from_i32) {
                Some(Errno::ENOKEY) => Error::NoKey { uid: uid.clone() },
                Some(Errno::EKEYREJECTED) => Error::BadKey {
                    uid: uid.clone(),
                    reason: "rejected by kernel".into(),
                },
                _ => Error::Udev(e),
            })?;

        Ok(if self.fresh {
            SecurityLevel::User
        } else {
            SecurityLevel::Secure
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn generate_then_hex_round_trips_through_from_hex() {
        let (key, _source) = Key::generate().unwrap();
        let hex = key.to_hex();
        assert_eq!(hex.len(), KEY_HEX_LEN);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let uid = Uid::new("test-uid");
        let loaded = Key::from_hex(&uid, &hex).unwrap();
        assert_eq!(loaded.to_hex(), hex);
        assert!(!loaded.is_fresh(), "a key parsed from text is never fresh");
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let uid = Uid::new("test-uid");
        assert!(Key::from_hex(&uid, "abcd").is_err());
    }

    #[test]
    fn save_then_load_round_trips_byte_exactly() {
        let uid = Uid::new("test-uid");
        let (key, _) = Key::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join(uid.as_str());

        key.save(&path).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let loaded = Key::load(&uid, &path).unwrap();
        assert_eq!(loaded.to_hex(), key.to_hex());
        assert!(!loaded.is_fresh());
    }

    #[test]
    fn fresh_key_reports_distinct_hex_each_time() {
        let (a, _) = Key::generate().unwrap();
        let (b, _) = Key::generate().unwrap();
        assert_ne!(a.to_hex(), b.to_hex());
    }
}
