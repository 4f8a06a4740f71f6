// boltd - Thunderbolt/USB4 device authorization daemon
//
// Miscellaneous helpers. Adapted from the teacher's `util.rs`: retains
// `parse_hex` for sysfs attribute parsing and the `nix`-based wall-clock
// helper, drops everything that only the debugfs/register tooling needed
// (CRC, RegBit/RegField, UTF-16 decoding).

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use num_traits::Num;

/// Parse hexadecimal from string, with or without a leading `0x`.
pub fn parse_hex<T: Num + FromStr>(s: &str) -> Option<T> {
    let val = s.strip_prefix("0x").unwrap_or(s);
    <T>::from_str_radix(val, 16).ok()
}

/// Microseconds since the Unix epoch, as used for `conntime`/`authtime`/
/// `storetime` device timestamps and for journal entries.
pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_with_and_without_prefix() {
        assert_eq!(parse_hex::<u32>("0x1234"), Some(0x1234));
        assert_eq!(parse_hex::<u32>("1234"), Some(0x1234));
        assert_eq!(parse_hex::<u32>("not hex"), None);
    }

    #[test]
    fn now_usec_is_monotonic_enough() {
        let a = now_usec();
        let b = now_usec();
        assert!(b >= a);
    }
}
