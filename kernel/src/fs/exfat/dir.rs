//! Directory entry sets
//!
//! The root directory (one cluster in this kernel) is a run of 32-byte
//! entries. A file is described by an entry set: a primary file entry
//! (0x85), one stream extension (0xC0) carrying first cluster and size,
//! and one or more file-name entries (0xC1) of 15 UTF-16LE units each.
//! 0x00 terminates the directory.
//!
//! Parsing runs as a small state machine over entry types; a sequence
//! that breaks the expected order abandons the current set and resumes
//! scanning, so one damaged set does not hide the rest of the directory.

use alloc::{string::String, vec, vec::Vec};

use crate::error::KernelError;

use super::ExfatVolume;

/// Bytes per directory entry.
pub(crate) const ENTRY_SIZE: usize = 32;

/// Entry type bytes.
const TYPE_END: u8 = 0x00;
const TYPE_FILE: u8 = 0x85;
const TYPE_STREAM: u8 = 0xC0;
const TYPE_NAME: u8 = 0xC1;

/// Directory attribute bit in the primary entry's attributes field.
const ATTR_DIRECTORY: u16 = 0x10;
/// Archive attribute, set on files this kernel creates.
const ATTR_ARCHIVE: u16 = 0x20;

/// UTF-16 units per file-name entry.
const NAME_UNITS_PER_ENTRY: usize = 15;
/// Longest file name accepted when creating entries.
pub(crate) const NAME_MAX: usize = 255;

/// One parsed entry set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntryInfo {
    pub name: String,
    pub first_cluster: u32,
    pub size: u64,
    pub is_dir: bool,
    /// Byte offset of the primary entry within the directory cluster
    pub set_offset: usize,
    /// Bytes covered by the whole set
    pub set_len: usize,
}

fn le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap_or([0; 2]))
}

fn le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap_or([0; 4]))
}

fn le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap_or([0; 8]))
}

enum ParserState {
    /// Looking for a primary entry
    Scan,
    /// Primary seen, stream extension expected next
    Primary { offset: usize, is_dir: bool },
    /// Stream seen, collecting name entries
    Stream { pending: DirEntryInfo },
}

/// Entry-set state machine. Feed it 32-byte entries in directory order;
/// it emits a [`DirEntryInfo`] whenever a set completes.
pub(crate) struct EntrySetParser {
    state: ParserState,
}

impl EntrySetParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParserState::Scan,
        }
    }

    /// Process the entry at byte `offset`. May emit a completed set.
    pub(crate) fn feed(&mut self, offset: usize, entry: &[u8]) -> Option<DirEntryInfo> {
        let entry_type = entry[0];
        let mut emitted = None;

        let state = core::mem::replace(&mut self.state, ParserState::Scan);

        // a set completes when something other than a name entry follows
        // at least one collected name
        let state = match state {
            ParserState::Stream { pending } if entry_type != TYPE_NAME => {
                if !pending.name.is_empty() {
                    let mut done = pending;
                    done.set_len = offset - done.set_offset;
                    emitted = Some(done);
                }
                ParserState::Scan
            }
            other => other,
        };

        self.state = match (state, entry_type) {
            (_, TYPE_FILE) => {
                let attributes = le16(entry, 4);
                ParserState::Primary {
                    offset,
                    is_dir: attributes & ATTR_DIRECTORY != 0,
                }
            }
            (ParserState::Primary { offset: set_offset, is_dir }, TYPE_STREAM) => {
                ParserState::Stream {
                    pending: DirEntryInfo {
                        name: String::new(),
                        first_cluster: le32(entry, 20),
                        size: le64(entry, 24),
                        is_dir,
                        set_offset,
                        set_len: 0,
                    },
                }
            }
            (ParserState::Stream { mut pending }, TYPE_NAME) => {
                for unit in 0..NAME_UNITS_PER_ENTRY {
                    let ch = le16(entry, 2 + unit * 2);
                    if ch == 0 {
                        continue; // padding
                    }
                    if pending.name.len() < NAME_MAX {
                        pending.name.push(if ch < 128 {
                            (ch as u8) as char
                        } else {
                            '?' // lossy outside ASCII
                        });
                    }
                }
                ParserState::Stream { pending }
            }
            // anything else breaks the sequence
            _ => ParserState::Scan,
        };
        emitted
    }

    /// Flush a set still pending at the end of the directory.
    pub(crate) fn finish(self, end_offset: usize) -> Option<DirEntryInfo> {
        if let ParserState::Stream { pending } = self.state {
            if !pending.name.is_empty() {
                let mut done = pending;
                done.set_len = end_offset - done.set_offset;
                return Some(done);
            }
        }
        None
    }
}

/// Parse every entry set out of a raw directory cluster.
pub(crate) fn parse_directory(cluster: &[u8]) -> Vec<DirEntryInfo> {
    let mut parser = EntrySetParser::new();
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + ENTRY_SIZE <= cluster.len() {
        let entry = &cluster[offset..offset + ENTRY_SIZE];
        if entry[0] == TYPE_END {
            if let Some(done) = parser.finish(offset) {
                entries.push(done);
            }
            return entries;
        }
        if let Some(done) = parser.feed(offset, entry) {
            entries.push(done);
        }
        offset += ENTRY_SIZE;
    }
    if let Some(done) = parser.finish(offset) {
        entries.push(done);
    }
    entries
}

fn read_root(volume: &ExfatVolume) -> Result<Vec<u8>, KernelError> {
    let mut cluster = vec![0u8; volume.cluster_size as usize];
    volume.read_cluster(volume.root_dir_cluster, &mut cluster)?;
    Ok(cluster)
}

/// All entry sets in the root directory.
pub(crate) fn scan_root(volume: &ExfatVolume) -> Result<Vec<DirEntryInfo>, KernelError> {
    Ok(parse_directory(&read_root(volume)?))
}

/// Locate one root entry by exact name.
pub(crate) fn find_by_name(
    volume: &ExfatVolume,
    name: &str,
) -> Result<Option<DirEntryInfo>, KernelError> {
    Ok(scan_root(volume)?.into_iter().find(|e| e.name == name))
}

/// Append an entry set for a new empty file owning `first_cluster`.
pub(crate) fn create_entry(
    volume: &ExfatVolume,
    name: &str,
    first_cluster: u32,
) -> Result<(), KernelError> {
    if name.is_empty() || name.len() > NAME_MAX || !name.is_ascii() {
        return Err(KernelError::InvalidArgument);
    }
    let mut cluster = read_root(volume)?;

    // first end-marker slot
    let mut offset = 0;
    while offset + ENTRY_SIZE <= cluster.len() && cluster[offset] != TYPE_END {
        offset += ENTRY_SIZE;
    }

    let name_entries = name.len().div_ceil(NAME_UNITS_PER_ENTRY);
    let secondary_count = 1 + name_entries;
    let set_bytes = (1 + secondary_count) * ENTRY_SIZE;
    // room for the set plus the moved end marker
    if offset + set_bytes + ENTRY_SIZE > cluster.len() {
        return Err(KernelError::OutOfMemory);
    }

    cluster[offset..offset + set_bytes].fill(0);

    // primary file entry
    cluster[offset] = TYPE_FILE;
    cluster[offset + 1] = secondary_count as u8;
    cluster[offset + 4..offset + 6].copy_from_slice(&ATTR_ARCHIVE.to_le_bytes());

    // stream extension
    let stream = offset + ENTRY_SIZE;
    cluster[stream] = TYPE_STREAM;
    cluster[stream + 3] = name.len() as u8;
    cluster[stream + 20..stream + 24].copy_from_slice(&first_cluster.to_le_bytes());
    cluster[stream + 24..stream + 32].copy_from_slice(&0u64.to_le_bytes());

    // file-name entries, 15 UTF-16LE units apiece, zero padded
    let bytes = name.as_bytes();
    for entry_index in 0..name_entries {
        let base = stream + (1 + entry_index) * ENTRY_SIZE;
        cluster[base] = TYPE_NAME;
        for unit in 0..NAME_UNITS_PER_ENTRY {
            let char_index = entry_index * NAME_UNITS_PER_ENTRY + unit;
            let value = if char_index < bytes.len() {
                u16::from(bytes[char_index])
            } else {
                0
            };
            cluster[base + 2 + unit * 2..base + 4 + unit * 2]
                .copy_from_slice(&value.to_le_bytes());
        }
    }

    cluster[offset + set_bytes] = TYPE_END;
    volume.write_cluster(volume.root_dir_cluster, &cluster)
}

/// Zero out an entry set; its first slot becomes an end marker for the
/// scan, which stops at the first 0x00 type byte.
pub(crate) fn remove_entry(volume: &ExfatVolume, entry: &DirEntryInfo) -> Result<(), KernelError> {
    let mut cluster = read_root(volume)?;
    let end = (entry.set_offset + entry.set_len).min(cluster.len());
    cluster[entry.set_offset..end].fill(0);

    // keep later sets reachable: if anything follows, the freed slots
    // must not read as end-of-directory
    if end + ENTRY_SIZE <= cluster.len() && cluster[end] != TYPE_END {
        for slot in (entry.set_offset..end).step_by(ENTRY_SIZE) {
            cluster[slot] = 0x05; // unused-entry marker, skipped by the parser
        }
    }
    volume.write_cluster(volume.root_dir_cluster, &cluster)
}

/// Rewrite the stream extension whose first cluster is `match_first` with
/// a new first cluster and size.
pub(crate) fn update_stream(
    volume: &ExfatVolume,
    match_first: u32,
    new_first: u32,
    new_size: u64,
) -> Result<(), KernelError> {
    let mut cluster = read_root(volume)?;
    let mut offset = 0;
    while offset + 2 * ENTRY_SIZE <= cluster.len() && cluster[offset] != TYPE_END {
        if cluster[offset] == TYPE_FILE && cluster[offset + ENTRY_SIZE] == TYPE_STREAM {
            let stream = offset + ENTRY_SIZE;
            if le32(&cluster, stream + 20) == match_first {
                cluster[stream + 20..stream + 24].copy_from_slice(&new_first.to_le_bytes());
                cluster[stream + 24..stream + 32].copy_from_slice(&new_size.to_le_bytes());
                return volume.write_cluster(volume.root_dir_cluster, &cluster);
            }
        }
        offset += ENTRY_SIZE;
    }
    Err(KernelError::NotFound)
}
