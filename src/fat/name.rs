//! Long file names (VFAT LFN checksum + `~n` short-name collision
//! resolution) and the exFAT NameHash + per-entry-set checksum used by its
//! File/Stream/FileName directory-entry triad.

use std::collections::HashMap;

const SHORT_NAME_INVALID: &[u8] = b"\"*+,./:;<=>?[\\]|";

fn is_valid_short_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || !SHORT_NAME_INVALID.contains(&c) && c > 0x20 && c < 0x7F
}

/// Splits a long name into an uppercased, invalid-character-stripped 8.3
/// basis name and extension, as DOS does before appending a `~n` suffix.
fn basis_name(long_name: &str) -> ([u8; 8], [u8; 3], bool) {
    let upper: String = long_name.chars().map(|c| c.to_ascii_uppercase()).collect();
    let (stem, ext) = match upper.rfind('.') {
        Some(idx) if idx > 0 => (&upper[..idx], &upper[idx + 1..]),
        _ => (upper.as_str(), ""),
    };

    let mut lossy = false;
    let mut filter = |s: &str, cap: usize| -> Vec<u8> {
        let mut out = Vec::with_capacity(cap);
        for c in s.chars() {
            if out.len() == cap {
                lossy = true;
                break;
            }
            if c == ' ' || c == '.' {
                lossy = true;
                continue;
            }
            let b = c as u32;
            if b > 0x7F || !is_valid_short_char(b as u8) {
                lossy = true;
                out.push(b'_');
            } else {
                out.push(b as u8);
            }
        }
        out
    };

    let stem_bytes = filter(stem, 8);
    let ext_bytes = filter(ext, 3);
    lossy = lossy || long_name.chars().any(|c| c.is_ascii_lowercase()) || stem.len() > 8 || ext.len() > 3;

    let mut name = [b' '; 8];
    name[..stem_bytes.len()].copy_from_slice(&stem_bytes);
    let mut extension = [b' '; 3];
    extension[..ext_bytes.len()].copy_from_slice(&ext_bytes);

    (name, extension, lossy)
}

/// Derives the 8.3 short name for `long_name`, given a closure that reports
/// whether a candidate short name already exists in the directory. Follows
/// the standard `NAME~n.EXT` numeric-tail scheme, trying `~1` through `~999999`
/// before giving up.
pub fn derive_short_name(long_name: &str, exists: impl Fn(&[u8; 8], &[u8; 3]) -> bool) -> Option<([u8; 8], [u8; 3])> {
    let (name, ext, needs_tail) = basis_name(long_name);

    if !needs_tail && !exists(&name, &ext) {
        return Some((name, ext));
    }

    for n in 1..=999_999u32 {
        let suffix = format!("~{n}");
        let keep = 8usize.saturating_sub(suffix.len());
        let mut candidate = [b' '; 8];
        let stem_len = name.iter().rposition(|&b| b != b' ').map_or(0, |i| i + 1).min(keep);
        candidate[..stem_len].copy_from_slice(&name[..stem_len]);
        candidate[stem_len..stem_len + suffix.len()].copy_from_slice(suffix.as_bytes());

        if !exists(&candidate, &ext) {
            return Some((candidate, ext));
        }
    }

    None
}

/// VFAT LFN checksum over an 11-byte short name, stored in every LFN entry
/// so a reader can detect a short-name/long-name entry mismatch.
pub fn lfn_checksum(short_name: &[u8; 8], short_ext: &[u8; 3]) -> u8 {
    let mut sum: u8 = 0;
    for &b in short_name.iter().chain(short_ext.iter()) {
        sum = (sum >> 1).wrapping_add(if sum & 1 != 0 { 0x80 } else { 0 }).wrapping_add(b);
    }
    sum
}

/// Splits a long name into the reversed sequence of 13-UTF16-unit LFN
/// fragments a VFAT short-entry's preceding LFN entries carry, last fragment
/// first (the order they're written to disk in, ORed with 0x40 on the
/// first -- i.e. last -- one by the caller).
pub fn lfn_fragments(long_name: &str) -> Vec<[u16; 13]> {
    let units: Vec<u16> = long_name.encode_utf16().collect();
    let mut fragments = Vec::new();

    for chunk in units.chunks(13) {
        let mut frag = [0xFFFFu16; 13];
        frag[..chunk.len()].copy_from_slice(chunk);
        if chunk.len() < 13 {
            frag[chunk.len()] = 0x0000;
        }
        fragments.push(frag);
    }
    if fragments.is_empty() {
        fragments.push([0x0000; 13]);
    }

    fragments.reverse();
    fragments
}

/// exFAT's NameHash: a running CRC-16/XMODEM-like hash over the upcased
/// UTF-16LE name, stored in the StreamExtension entry for fast duplicate
/// detection without a full name compare.
pub fn exfat_name_hash(name: &str, upcase: &UpcaseTable) -> u16 {
    let mut hash: u16 = 0;
    for unit in name.encode_utf16() {
        let upper = upcase.upcase(unit);
        for byte in upper.to_le_bytes() {
            hash = if hash & 1 != 0 { 0x8000 } else { 0 } + (hash >> 1);
            hash = hash.wrapping_add(byte as u16);
        }
    }
    hash
}

/// exFAT's per-entry-set checksum: rotate-right-by-one-bit-then-add over
/// every byte of a File entry and its secondaries, skipping the checksum
/// field itself (bytes 2-3 of the first entry).
pub fn exfat_set_checksum(entries: &[u8]) -> u16 {
    let mut checksum: u16 = 0;
    for (i, &byte) in entries.iter().enumerate() {
        if i == 2 || i == 3 {
            continue;
        }
        checksum = if checksum & 1 != 0 { 0x8000 } else { 0 } + (checksum >> 1);
        checksum = checksum.wrapping_add(byte as u16);
    }
    checksum
}

/// exFAT's up-case table: a sparse map from code point to its upper-case
/// form, parsed from the on-disk compressed format (entry type 0x82) where a
/// `0xFFFF` marker followed by a count means the next `count` code points
/// map to themselves. Falls back to plain ASCII case folding — the same
/// mapping the real default up-case table uses for that range — when no
/// on-disk table has been loaded.
#[derive(Debug, Clone)]
pub struct UpcaseTable {
    overrides: HashMap<u16, u16>,
}

impl UpcaseTable {
    pub fn parse(data: &[u8]) -> Self {
        let mut overrides = HashMap::new();
        let mut index: u32 = 0;
        let mut i = 0;

        while i + 1 < data.len() {
            let value = u16::from_le_bytes([data[i], data[i + 1]]);
            i += 2;

            if value == 0xFFFF && i + 1 < data.len() {
                let count = u16::from_le_bytes([data[i], data[i + 1]]);
                i += 2;
                index += count as u32;
                continue;
            }

            if index <= u16::MAX as u32 {
                overrides.insert(index as u16, value);
            }
            index += 1;
        }

        Self { overrides }
    }

    pub fn upcase(&self, unit: u16) -> u16 {
        *self.overrides.get(&unit).unwrap_or(&unit)
    }
}

impl Default for UpcaseTable {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        for c in b'a'..=b'z' {
            overrides.insert(c as u16, (c - 0x20) as u16);
        }
        Self { overrides }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_for_simple_ascii_pass_through() {
        let (name, ext, lossy) = basis_name("README.TXT");
        assert_eq!(&name, b"README  ");
        assert_eq!(&ext, b"TXT");
        assert!(!lossy);
    }

    #[test]
    fn long_names_get_a_numeric_tail() {
        let mut taken = std::collections::HashSet::new();
        taken.insert((*b"LONGFI~1", *b"TXT"));

        let (name, ext) = derive_short_name("LongFileName.txt", |n, e| taken.contains(&(*n, *e))).unwrap();
        assert_eq!(&ext, b"TXT");
        assert_eq!(&name[0..7], b"LONGFI~");
        assert_ne!(name, *b"LONGFI~1");
    }

    #[test]
    fn lfn_fragments_cover_whole_name_reversed() {
        let long = "a".repeat(20);
        let frags = lfn_fragments(&long);
        assert_eq!(frags.len(), 2);
        // Last fragment on disk comes first in our reversed order.
        assert_eq!(frags[0][0], 'a' as u16);
    }

    #[test]
    fn exfat_hash_is_case_insensitive() {
        let upcase = UpcaseTable::default();
        assert_eq!(exfat_name_hash("hello.txt", &upcase), exfat_name_hash("HELLO.TXT", &upcase));
    }

    #[test]
    fn upcase_table_parses_compressed_identity_runs() {
        // index 0: 'a' -> 'A' (0x41), then a 0xFFFF marker skipping 2
        // code points (1, 2), which stay identity-mapped.
        let mut data = Vec::new();
        data.extend_from_slice(&0x0041u16.to_le_bytes());
        data.extend_from_slice(&0xFFFFu16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&0x0044u16.to_le_bytes()); // index 3 -> 0x44

        let table = UpcaseTable::parse(&data);
        assert_eq!(table.upcase(0), 0x41);
        assert_eq!(table.upcase(1), 1);
        assert_eq!(table.upcase(2), 2);
        assert_eq!(table.upcase(3), 0x44);
    }

    #[test]
    fn set_checksum_ignores_its_own_field() {
        let mut entries = vec![0u8; 64];
        entries[0] = 0x85;
        let checksum = exfat_set_checksum(&entries);
        entries[2..4].copy_from_slice(&checksum.to_le_bytes());
        // Recomputing over the buffer with the checksum now filled in must
        // still match, since those two bytes are skipped either way.
        assert_eq!(exfat_set_checksum(&entries), checksum);
    }
}
