use std::{
    collections::HashSet,
    io::{BufRead, BufReader},
    path::Path,
};

use n0_error::{Result, StdResultExt};
use tracing::info;

/// The set of forbidden hostnames and IPv4 addresses.
///
/// Loaded once before any worker starts and read-only afterwards. Hostnames
/// match case-insensitively. IPv4 patterns may use `*` for any octet; each
/// `*` is expanded to all 256 values at load time, so matching stays an
/// exact set lookup on the hot path.
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: HashSet<String>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a blacklist file: one entry per line, blank lines and lines
    /// starting with `#` ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .std_context(format!("failed to open blacklist file {}", path.display()))?;
        let mut blacklist = Self::new();
        for line in BufReader::new(file).lines() {
            let line = line.std_context("failed to read blacklist line")?;
            blacklist.add_entry(&line);
        }
        info!(
            entries = blacklist.entries.len(),
            "loaded blacklist from {}", path.display()
        );
        Ok(blacklist)
    }

    /// Adds one blacklist line: an IPv4 pattern (expanded) or a literal
    /// hostname. Comments and blank lines are ignored.
    pub fn add_entry(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        match parse_ip_pattern(line) {
            Some(octets) => expand_pattern(&octets, &mut self.entries),
            None => {
                self.entries.insert(line.to_ascii_lowercase());
            }
        }
    }

    /// True when `host` (hostname or IP text) is not blocked.
    pub fn allowed(&self, host: &str) -> bool {
        !self.entries.contains(&host.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Classifies a line as an IPv4 pattern: four dot-separated fields, each
/// one to three digits or `*`. `None` octets are wildcards.
fn parse_ip_pattern(line: &str) -> Option<[Option<u8>; 4]> {
    let mut octets = [None; 4];
    let mut fields = line.split('.');
    for slot in &mut octets {
        let field = fields.next()?;
        if field == "*" {
            *slot = None;
        } else if !field.is_empty()
            && field.len() <= 3
            && field.bytes().all(|b| b.is_ascii_digit())
        {
            *slot = Some(field.parse().ok()?);
        } else {
            return None;
        }
    }
    if fields.next().is_some() {
        return None;
    }
    Some(octets)
}

fn expand_pattern(octets: &[Option<u8>; 4], out: &mut HashSet<String>) {
    fn walk(octets: &[Option<u8>; 4], idx: usize, concrete: &mut [u8; 4], out: &mut HashSet<String>) {
        if idx == 4 {
            out.insert(format!(
                "{}.{}.{}.{}",
                concrete[0], concrete[1], concrete[2], concrete[3]
            ));
            return;
        }
        match octets[idx] {
            Some(value) => {
                concrete[idx] = value;
                walk(octets, idx + 1, concrete, out);
            }
            None => {
                for value in 0..=255 {
                    concrete[idx] = value;
                    walk(octets, idx + 1, concrete, out);
                }
            }
        }
    }
    walk(octets, 0, &mut [0; 4], out);
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn load_from(contents: &str) -> Blacklist {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        Blacklist::load(file.path()).unwrap()
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let blacklist = load_from("# a comment\n\nbad.test\n");
        assert_eq!(blacklist.len(), 1);
        assert!(!blacklist.allowed("bad.test"));
        assert!(blacklist.allowed("# a comment"));
    }

    #[test]
    fn hostnames_match_case_insensitively() {
        let blacklist = load_from("Bad.Test\n");
        assert!(!blacklist.allowed("bad.test"));
        assert!(!blacklist.allowed("BAD.TEST"));
        assert!(blacklist.allowed("good.test"));
    }

    #[test]
    fn concrete_ip_is_blocked() {
        let blacklist = load_from("192.168.0.1\n");
        assert!(!blacklist.allowed("192.168.0.1"));
        assert!(blacklist.allowed("192.168.0.2"));
    }

    #[test]
    fn single_star_expands_to_all_octet_values() {
        let blacklist = load_from("10.0.0.*\n");
        assert_eq!(blacklist.len(), 256);
        for i in [0u8, 1, 77, 255] {
            assert!(!blacklist.allowed(&format!("10.0.0.{i}")));
        }
        assert!(blacklist.allowed("10.0.1.5"));
    }

    #[test]
    fn two_stars_expand_to_65536_entries() {
        let blacklist = load_from("10.1.*.*\n");
        assert_eq!(blacklist.len(), 65536);
        assert!(!blacklist.allowed("10.1.255.0"));
        assert!(!blacklist.allowed("10.1.0.255"));
        assert!(blacklist.allowed("10.2.0.0"));
    }

    #[test]
    fn non_ip_dotted_line_is_a_hostname() {
        let blacklist = load_from("1234.5.6.7\na.b.c.d\n");
        // Too many digits for an octet, so it's a literal entry.
        assert!(!blacklist.allowed("1234.5.6.7"));
        assert!(!blacklist.allowed("a.b.c.d"));
        assert_eq!(blacklist.len(), 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Blacklist::load("/definitely/not/here.txt").is_err());
    }
}
