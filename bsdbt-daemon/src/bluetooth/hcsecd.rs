/*!
 * hcsecd.conf Management
 * Read-modify-write of pairing entries, consumed by hcsecd(8)
 */

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use super::{BdAddr, DeviceName, Pin};

/// First line of a configuration file created from scratch.
pub const GENERATED_HEADER: &str = "# hcsecd.conf generated by bsdbt\n";

/// Name written when neither the request nor an existing entry supplies one.
pub const DEFAULT_NAME: &str = "Unknown";

#[derive(Debug, Error)]
pub enum HcsecdError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} ends inside an unterminated device block", path.display())]
    Unterminated { path: PathBuf },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Replaced,
}

/// One `device { ... }` block to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingEntry {
    pub address: BdAddr,
    pub name: Option<DeviceName>,
    pub pin: Pin,
}

impl PairingEntry {
    pub fn new(address: BdAddr, pin: Pin) -> Self {
        Self {
            address,
            name: None,
            pin,
        }
    }

    pub fn with_name(mut self, name: DeviceName) -> Self {
        self.name = Some(name);
        self
    }

    fn render(&self, existing_name: Option<&str>) -> String {
        let name = self
            .name
            .as_ref()
            .map(DeviceName::as_str)
            .or(existing_name)
            .unwrap_or(DEFAULT_NAME);
        format!(
            "device {{\n\tbdaddr\t{};\n\tname\t\"{}\";\n\tkey\tnokey;\n\tpin\t\"{}\";\n}}\n",
            self.address,
            name,
            self.pin.as_str()
        )
    }
}

pub struct HcsecdConfig {
    path: PathBuf,
}

impl HcsecdConfig {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Addresses that currently have an entry. A missing file has none.
    pub fn paired_addresses(&self) -> Result<HashSet<BdAddr>, HcsecdError> {
        let Some(text) = self.read()? else {
            return Ok(HashSet::new());
        };
        Ok(parse_document(&text)
            .iter()
            .filter_map(Segment::address)
            .collect())
    }

    /// Replaces the entry for `entry.address` in place, or appends one.
    /// A file ending inside an open block is refused and left as is.
    ///
    /// Everything outside the affected block is written back byte for byte.
    /// Later blocks for the same address are dropped so the file never holds
    /// two entries for one device. The new contents replace the old file
    /// atomically.
    pub fn upsert(&self, entry: &PairingEntry) -> Result<UpsertOutcome, HcsecdError> {
        let existing = self.read()?;
        let text = existing.as_deref().unwrap_or(GENERATED_HEADER);

        let segments = parse_document(text);
        if segments.iter().any(|s| matches!(s, Segment::Unterminated(_))) {
            return Err(HcsecdError::Unterminated {
                path: self.path.clone(),
            });
        }

        let mut out = String::with_capacity(text.len() + 128);
        let mut outcome = UpsertOutcome::Added;

        for segment in segments {
            match segment {
                Segment::Device {
                    address: Some(address),
                    name,
                    ..
                } if address == entry.address => {
                    if outcome == UpsertOutcome::Added {
                        out.push_str(&entry.render(name.as_deref()));
                        outcome = UpsertOutcome::Replaced;
                    } else {
                        tracing::warn!(device = %address, "Dropping duplicate hcsecd.conf entry");
                    }
                }
                other => out.push_str(other.raw()),
            }
        }

        if outcome == UpsertOutcome::Added {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
            out.push_str(&entry.render(None));
        }

        self.write_atomic(&out)?;
        tracing::info!(
            device = %entry.address,
            path = %self.path.display(),
            ?outcome,
            "Updated hcsecd configuration"
        );
        Ok(outcome)
    }

    fn read(&self) -> Result<Option<String>, HcsecdError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(HcsecdError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Writes to a temporary file in the same directory, then renames it
    /// over the target.
    fn write_atomic(&self, contents: &str) -> Result<(), HcsecdError> {
        let write_err = |source: io::Error| HcsecdError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(contents.as_bytes()).map_err(write_err)?;
        if let Ok(meta) = fs::metadata(&self.path) {
            tmp.as_file()
                .set_permissions(meta.permissions())
                .map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

// ── Parsing ─────────────────────────────────────────────────

enum Segment<'a> {
    /// Anything outside a device block.
    Text(&'a str),
    /// A `device` block whose closing brace never comes.
    Unterminated(&'a str),
    Device {
        raw: &'a str,
        address: Option<BdAddr>,
        name: Option<String>,
    },
}

impl<'a> Segment<'a> {
    fn device(raw: &'a str) -> Self {
        let mut address = None;
        let mut name = None;

        let code: String = raw
            .split_inclusive('\n')
            .map(strip_comment)
            .collect::<Vec<_>>()
            .join("\n");

        for statement in split_statements(&code) {
            let Some((key, value)) = statement.trim().split_once(char::is_whitespace) else {
                continue;
            };
            match key {
                "bdaddr" => address = value.trim().parse().ok(),
                "name" => name = Some(value.trim().trim_matches('"').to_string()),
                _ => {}
            }
        }

        Segment::Device { raw, address, name }
    }

    fn raw(&self) -> &'a str {
        match self {
            Segment::Text(raw) | Segment::Unterminated(raw) | Segment::Device { raw, .. } => *raw,
        }
    }

    fn address(&self) -> Option<BdAddr> {
        match self {
            Segment::Device { address, .. } => *address,
            Segment::Text(_) | Segment::Unterminated(_) => None,
        }
    }
}

/// Splits the file into text and device blocks. Concatenating the raw
/// segments gives back the input exactly.
///
/// A block ends at its matching `}`; whitespace up to the end of that line
/// belongs to the block, anything else after the brace starts a new segment.
fn parse_document(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut open: Option<OpenBlock> = None;
    let mut in_quotes = false;
    let mut in_comment = false;

    for (idx, ch) in text.char_indices() {
        if in_comment {
            in_comment = ch != '\n';
            continue;
        }
        if in_quotes {
            in_quotes = !matches!(ch, '"' | '\n');
            continue;
        }

        match ch {
            '#' => in_comment = true,
            '"' => in_quotes = true,
            '{' => {
                if let Some(block) = open.as_mut() {
                    block.depth += 1;
                    block.opened = true;
                }
            }
            '}' => {
                let closed = open.as_mut().is_some_and(|block| {
                    block.depth -= 1;
                    block.opened && block.depth <= 0
                });
                if let Some(block) = closed.then(|| open.take()).flatten() {
                    let end = block_end(text, idx + 1);
                    if text_start < block.start {
                        segments.push(Segment::Text(&text[text_start..block.start]));
                    }
                    segments.push(Segment::device(&text[block.start..end]));
                    text_start = end;
                }
            }
            _ if open.is_none() && starts_device_block(text, idx) => {
                open = Some(OpenBlock::at(block_start(text, text_start, idx)));
            }
            _ => {}
        }
    }

    match open {
        Some(block) => {
            tracing::warn!("Unterminated device block in hcsecd.conf");
            if text_start < block.start {
                segments.push(Segment::Text(&text[text_start..block.start]));
            }
            segments.push(Segment::Unterminated(&text[block.start..]));
        }
        None if text_start < text.len() => segments.push(Segment::Text(&text[text_start..])),
        None => {}
    }

    segments
}

struct OpenBlock {
    start: usize,
    depth: i32,
    opened: bool,
}

impl OpenBlock {
    fn at(start: usize) -> Self {
        Self {
            start,
            depth: 0,
            opened: false,
        }
    }
}

/// `device` as a statement keyword at `idx`, followed by whitespace or `{`.
fn starts_device_block(text: &str, idx: usize) -> bool {
    let Some(rest) = text[idx..].strip_prefix("device") else {
        return false;
    };
    let before = text[..idx].trim_end_matches([' ', '\t']);
    let at_statement = before.is_empty() || before.ends_with(['\n', ';', '}']);
    at_statement && (rest.is_empty() || rest.starts_with(|c: char| c == '{' || c.is_whitespace()))
}

/// Indentation in front of the keyword goes with the block when the keyword
/// opens its line.
fn block_start(text: &str, text_start: usize, keyword: usize) -> usize {
    let line_start = text[..keyword].rfind('\n').map_or(0, |nl| nl + 1);
    if line_start >= text_start && text[line_start..keyword].trim().is_empty() {
        line_start
    } else {
        keyword
    }
}

/// Offset just past the closing brace, extended over trailing whitespace and
/// the newline when nothing else follows on that line.
fn block_end(text: &str, after_brace: usize) -> usize {
    let rest = &text[after_brace..];
    match rest.find('\n') {
        Some(nl) if rest[..nl].trim().is_empty() => after_brace + nl + 1,
        None if rest.trim().is_empty() => text.len(),
        _ => after_brace,
    }
}

/// Characters outside double quotes, with their byte offsets.
fn unquoted(s: &str) -> impl Iterator<Item = (usize, char)> + '_ {
    let mut in_quotes = false;
    s.char_indices().filter(move |&(_, ch)| {
        if ch == '"' {
            in_quotes = !in_quotes;
            return false;
        }
        !in_quotes
    })
}

fn strip_comment(line: &str) -> &str {
    match unquoted(line).find(|&(_, ch)| ch == '#') {
        Some((idx, _)) => &line[..idx],
        None => line.trim_end_matches(['\n', '\r']),
    }
}

fn split_statements(code: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    for (idx, ch) in unquoted(code) {
        if matches!(ch, ';' | '{' | '}') {
            statements.push(&code[start..idx]);
            start = idx + ch.len_utf8();
        }
    }
    statements.push(&code[start..]);
    statements
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const FIXTURE: &str = "\
# Default hcsecd.conf
device {
\tbdaddr\t11:11:11:11:11:11;
\tname\t\"Test\";
\tkey\tnokey;
\tpin\t\"1111\";
}

# keyboard in the study
device {
\tbdaddr\t22:22:22:22:22:22; # trailing comment
\tname\t\"Brace } and # inside\";
\tkey\t0x0123456789abcdef0123456789abcdef;
\tpin\tnopin;
}
";

    fn addr(s: &str) -> BdAddr {
        s.parse().unwrap()
    }

    fn entry(address: &str, pin: &str) -> PairingEntry {
        PairingEntry::new(addr(address), Pin::new(pin).unwrap())
    }

    fn config_in(dir: &TempDir, contents: Option<&str>) -> HcsecdConfig {
        let path = dir.path().join("hcsecd.conf");
        if let Some(contents) = contents {
            fs::write(&path, contents).unwrap();
        }
        HcsecdConfig::new(path)
    }

    fn entries_for(text: &str, address: BdAddr) -> usize {
        parse_document(text)
            .iter()
            .filter(|s| s.address() == Some(address))
            .count()
    }

    #[test]
    fn test_parse_document_is_lossless() {
        let joined: String = parse_document(FIXTURE).iter().map(Segment::raw).collect();
        assert_eq!(joined, FIXTURE);
    }

    #[test]
    fn test_paired_addresses_from_fixture() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, Some(FIXTURE));
        let paired = config.paired_addresses().unwrap();
        assert_eq!(
            paired,
            HashSet::from([addr("11:11:11:11:11:11"), addr("22:22:22:22:22:22")])
        );
    }

    #[test]
    fn test_single_line_and_commented_blocks() {
        let text = "device { bdaddr 01:02:03:04:05:06; name \"x\"; }\n# device { bdaddr 0a:0b:0c:0d:0e:0f; }\ndevice\n{\n bdaddr AA:BB:CC:DD:EE:FF;\n}\n";
        let addresses: Vec<_> = parse_document(text).iter().filter_map(Segment::address).collect();
        assert_eq!(addresses, vec![addr("01:02:03:04:05:06"), addr("aa:bb:cc:dd:ee:ff")]);
    }

    #[test]
    fn test_missing_file_has_no_entries_and_is_not_created() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, None);
        assert!(config.paired_addresses().unwrap().is_empty());
        assert!(!config.path().exists());
    }

    #[test]
    fn test_upsert_into_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, None);

        let outcome = config.upsert(&entry("AA:BB:CC:DD:EE:FF", "0000")).unwrap();

        assert_eq!(outcome, UpsertOutcome::Added);
        assert_eq!(
            fs::read_to_string(config.path()).unwrap(),
            "# hcsecd.conf generated by bsdbt\n\ndevice {\n\tbdaddr\taa:bb:cc:dd:ee:ff;\n\tname\t\"Unknown\";\n\tkey\tnokey;\n\tpin\t\"0000\";\n}\n"
        );
    }

    #[test]
    fn test_upsert_twice_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, None);

        config.upsert(&entry("AA:BB:CC:DD:EE:FF", "1234")).unwrap();
        let outcome = config.upsert(&entry("aa:bb:cc:dd:ee:ff", "9876")).unwrap();

        let text = fs::read_to_string(config.path()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Replaced);
        assert_eq!(entries_for(&text, addr("aa:bb:cc:dd:ee:ff")), 1);
        assert!(text.contains("pin\t\"9876\";"));
        assert!(!text.contains("1234"));
    }

    #[test]
    fn test_upsert_leaves_unrelated_entries_untouched() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, Some(FIXTURE));

        let outcome = config
            .upsert(&entry("11:11:11:11:11:11", "4321"))
            .unwrap();

        let text = fs::read_to_string(config.path()).unwrap();
        let expected = FIXTURE.replace("pin\t\"1111\"", "pin\t\"4321\"");
        assert_eq!(outcome, UpsertOutcome::Replaced);
        assert_eq!(text, expected);
    }

    #[test]
    fn test_upsert_appends_new_device() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, Some(FIXTURE));

        let new = entry("00:11:22:33:44:55", "1234").with_name(DeviceName::new("NewDevice").unwrap());
        assert_eq!(config.upsert(&new).unwrap(), UpsertOutcome::Added);

        let text = fs::read_to_string(config.path()).unwrap();
        assert!(text.starts_with(FIXTURE));
        assert!(text.contains("bdaddr\t00:11:22:33:44:55;"));
        assert!(text.contains("name\t\"NewDevice\";"));
        assert!(text.contains("pin\t\"1234\";"));
    }

    #[test]
    fn test_replace_keeps_existing_name() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, Some(FIXTURE));

        config.upsert(&entry("22:22:22:22:22:22", "0000")).unwrap();

        let text = fs::read_to_string(config.path()).unwrap();
        assert!(text.contains("name\t\"Brace } and # inside\";"));
        assert!(text.contains("pin\t\"0000\";"));
        assert_eq!(entries_for(&text, addr("22:22:22:22:22:22")), 1);
    }

    #[test]
    fn test_duplicate_entries_collapse() {
        let dir = TempDir::new().unwrap();
        let doubled = format!("{FIXTURE}device {{\n\tbdaddr\t11:11:11:11:11:11;\n}}\n");
        let config = config_in(&dir, Some(&doubled));

        config.upsert(&entry("11:11:11:11:11:11", "5555")).unwrap();

        let text = fs::read_to_string(config.path()).unwrap();
        assert_eq!(entries_for(&text, addr("11:11:11:11:11:11")), 1);
    }

    #[test]
    fn test_unterminated_block_is_refused() {
        let dir = TempDir::new().unwrap();
        let broken = "device {\n\tbdaddr\t33:33:33:33:33:33;\n";
        let config = config_in(&dir, Some(broken));

        let err = config.upsert(&entry("44:44:44:44:44:44", "0000")).unwrap_err();

        assert!(matches!(err, HcsecdError::Unterminated { .. }));
        assert_eq!(fs::read_to_string(config.path()).unwrap(), broken);
        assert!(config.paired_addresses().unwrap().is_empty());
    }

    #[test]
    fn test_two_blocks_on_one_line() {
        let line = "device { bdaddr 11:11:11:11:11:11; pin \"1111\"; } device { bdaddr 22:22:22:22:22:22; pin \"2222\"; }\n";
        let joined: String = parse_document(line).iter().map(Segment::raw).collect();
        assert_eq!(joined, line);

        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, Some(line));
        assert_eq!(
            config.paired_addresses().unwrap(),
            HashSet::from([addr("11:11:11:11:11:11"), addr("22:22:22:22:22:22")])
        );

        let outcome = config.upsert(&entry("22:22:22:22:22:22", "0000")).unwrap();

        let text = fs::read_to_string(config.path()).unwrap();
        assert_eq!(outcome, UpsertOutcome::Replaced);
        assert!(text.starts_with("device { bdaddr 11:11:11:11:11:11; pin \"1111\"; }"));
        assert!(text.contains("pin\t\"0000\";"));
        assert!(!text.contains("2222"));
        assert_eq!(entries_for(&text, addr("11:11:11:11:11:11")), 1);
        assert_eq!(entries_for(&text, addr("22:22:22:22:22:22")), 1);
    }

    #[test]
    fn test_keyword_inside_statement_does_not_open_block() {
        let text = "options { note device; }\ndevice { bdaddr 11:11:11:11:11:11; }\n";
        let addresses: Vec<_> = parse_document(text).iter().filter_map(Segment::address).collect();
        assert_eq!(addresses, vec![addr("11:11:11:11:11:11")]);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = HcsecdConfig::new(dir.path().join("missing-dir").join("hcsecd.conf"));

        let err = config.upsert(&entry("AA:BB:CC:DD:EE:FF", "0000")).unwrap_err();

        assert!(matches!(err, HcsecdError::Write { .. }));
        assert!(!config.path().exists());
    }

    #[test]
    fn test_read_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be read as a file.
        let config = HcsecdConfig::new(dir.path().to_path_buf());
        assert!(matches!(
            config.paired_addresses(),
            Err(HcsecdError::Read { .. })
        ));
    }
}
