//! Parsing of `FILE_NOTIFY_INFORMATION` batches
//!
//! Each record is a 12 byte header followed by a UTF-16 name:
//!
//! ```text
//! offset 0   u32  NextEntryOffset (0 on the last record)
//! offset 4   u32  Action
//! offset 8   u32  FileNameLength in bytes
//! offset 12  u16  FileName[FileNameLength / 2], relative to the root
//! ```
//!
//! The parser only reads inside the given slice; a malformed batch ends
//! early instead of reading past it.

use sentinel_core::event::join;
use sentinel_core::Event;
use tracing::warn;

pub const FILE_ACTION_ADDED: u32 = 1;
pub const FILE_ACTION_REMOVED: u32 = 2;
pub const FILE_ACTION_MODIFIED: u32 = 3;
pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 4;
pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 5;

const HEADER_LEN: usize = 12;

/// One decoded record; `name` uses `/` as separator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRecord {
    pub action: u32,
    pub name: String,
}

/// Iterator over the records of one completed read
pub struct Records<'a> {
    batch: &'a [u8],
    offset: Option<usize>,
}

impl<'a> Records<'a> {
    pub fn new(batch: &'a [u8]) -> Self {
        Self {
            batch,
            offset: (!batch.is_empty()).then_some(0),
        }
    }

    fn truncated(&mut self, start: usize) -> Option<NotifyRecord> {
        warn!(
            "Truncated notification record at offset {} of {} bytes",
            start,
            self.batch.len()
        );
        self.offset = None;
        None
    }
}

impl Iterator for Records<'_> {
    type Item = NotifyRecord;

    fn next(&mut self) -> Option<NotifyRecord> {
        let start = self.offset?;
        let Some(header) = start
            .checked_add(HEADER_LEN)
            .and_then(|end| self.batch.get(start..end))
        else {
            return self.truncated(start);
        };

        let next = read_u32(&header[0..4]) as usize;
        let action = read_u32(&header[4..8]);
        let name_len = read_u32(&header[8..12]) as usize;

        let name_start = start + HEADER_LEN;
        let Some(raw_name) = name_start
            .checked_add(name_len)
            .and_then(|end| self.batch.get(name_start..end))
        else {
            return self.truncated(start);
        };

        let units: Vec<u16> = raw_name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let name = String::from_utf16_lossy(&units).replace('\\', "/");

        self.offset = match next {
            0 => None,
            step => start.checked_add(step),
        };
        Some(NotifyRecord { action, name })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Split a root-relative name into its canonical directory and final component
fn locate(root: &str, name: &str) -> (String, String) {
    match name.rsplit_once('/') {
        Some((parent, file)) => (join(root, parent), file.to_string()),
        None => (root.to_string(), name.to_string()),
    }
}

/// Translate one batch into events, pairing adjacent rename halves
///
/// An old name that is not immediately followed by its new name becomes a
/// deletion; the following record is processed on its own. Renames across
/// directories become a deletion and a creation.
pub fn translate(root: &str, batch: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    let mut records = Records::new(batch).peekable();

    while let Some(record) = records.next() {
        let (directory, file) = locate(root, &record.name);
        match record.action {
            FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => {
                events.push(Event::created(directory, file));
            }
            FILE_ACTION_REMOVED => events.push(Event::deleted(directory, file)),
            FILE_ACTION_RENAMED_OLD_NAME => {
                match records.next_if(|next| next.action == FILE_ACTION_RENAMED_NEW_NAME) {
                    Some(new) => {
                        let (new_directory, new_file) = locate(root, &new.name);
                        if new_directory == directory {
                            events.push(Event::renamed(directory, file, new_file));
                        } else {
                            events.push(Event::deleted(directory, file));
                            events.push(Event::created(new_directory, new_file));
                        }
                    }
                    None => events.push(Event::deleted(directory, file)),
                }
            }
            _ => events.push(Event::modified(directory, file)),
        }
    }
    events
}

/// Lay out records the way the OS does, each aligned to four bytes
///
/// Used to feed the parser without an OS underneath.
pub fn encode(records: &[(u32, &str)]) -> Vec<u8> {
    let mut batch = Vec::new();
    for (index, (action, name)) in records.iter().enumerate() {
        let start = batch.len();
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_len = units.len() * 2;
        let unpadded = HEADER_LEN + name_len;
        let len = (unpadded + 3) & !3;
        let next = if index + 1 == records.len() { 0 } else { len };

        batch.extend_from_slice(&(next as u32).to_le_bytes());
        batch.extend_from_slice(&action.to_le_bytes());
        batch.extend_from_slice(&(name_len as u32).to_le_bytes());
        for unit in units {
            batch.extend_from_slice(&unit.to_le_bytes());
        }
        batch.resize(start + len, 0);
    }
    batch
}
