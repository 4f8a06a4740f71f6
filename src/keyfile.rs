// boltd - Thunderbolt/USB4 device authorization daemon
//
// A minimal reader/writer for the `[section]\nkey=value` keyfile format
// used by the store (spec.md §4.4) and the global config file. No crate
// in the retrieval pack implements this exact GLib-KeyFile-flavored
// format, so it is hand-parsed here, in the same small-regex-and-manual-
// parsing style the teacher uses for its own bespoke on-disk formats.

use std::collections::BTreeMap;
use std::fmt;

/// An ordered set of `[section] -> key -> value` entries. Sections and
/// keys preserve insertion order via `BTreeMap` only for determinism in
/// tests; real files are small enough this never matters for performance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyFile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.get(section, key).map(|v| v == "true" || v == "1")
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Parses the `[section]\nkey=value` text format. Blank lines and
    /// lines starting with `#` are ignored. Malformed lines outside any
    /// section, or a `key=value` line before any `[section]` header, are
    /// skipped rather than treated as an error — the store only ever
    /// reads files it wrote itself, so tolerance here is a defense
    /// against partial writes, not an invitation to a lenient format.
    pub fn parse(text: &str) -> Self {
        let mut file = Self::new();
        let mut section: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = Some(name.to_string());
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                if let Some(section) = &section {
                    file.set(section, key.trim(), value.trim());
                }
            }
        }

        file
    }

}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (section, entries) in &self.sections {
            writeln!(f, "[{section}]")?;
            for (key, value) in entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        let mut file = KeyFile::new();
        file.set("device", "name", "Laptop");
        file.set("device", "vendor", "GNOME.org");
        file.set("user", "policy", "auto");

        let text = file.to_string();
        let parsed = KeyFile::parse(&text);

        assert_eq!(parsed.get("device", "name"), Some("Laptop"));
        assert_eq!(parsed.get("device", "vendor"), Some("GNOME.org"));
        assert_eq!(parsed.get("user", "policy"), Some("auto"));
    }

    #[test]
    fn ignores_blank_lines_comments_and_orphan_keys() {
        let text = "# a comment\n\nkey=before any section\n[device]\nname=Foo\n";
        let parsed = KeyFile::parse(text);
        assert_eq!(parsed.get("device", "name"), Some("Foo"));
        assert!(!parsed.has_section(""));
    }

    #[test]
    fn get_bool_accepts_true_and_one() {
        let mut file = KeyFile::new();
        file.set("domain", "iommu", "true");
        file.set("domain", "other", "1");
        file.set("domain", "no", "false");
        assert_eq!(file.get_bool("domain", "iommu"), Some(true));
        assert_eq!(file.get_bool("domain", "other"), Some(true));
        assert_eq!(file.get_bool("domain", "no"), Some(false));
    }
}
