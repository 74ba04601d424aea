//! B-tree directory index decoding and traversal (C8).

use ntfsx_core::NtfsError;

use crate::attribute::{self, FileNameAttr};
use crate::block::DataBlock;
use crate::fixup;
use crate::structures::{
    self, IndexEntryHeaderRaw, IndexHeaderRaw, IndexRecordHeaderRaw, COLLATION_FILENAME,
    INDEX_ENTRY_LAST_IN_NODE, INDEX_ENTRY_POINTS_TO_SUBNODE,
};

/// One index entry: a key (absent for the terminal entry), the target file
/// reference, and an optional subnode VCN to descend into.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub file_reference: u64,
    pub key: Option<DataBlock>,
    pub child_vcn: Option<u64>,
    pub is_last: bool,
}

impl IndexEntry {
    fn decode(data: &DataBlock) -> Option<(IndexEntry, u16)> {
        let header: IndexEntryHeaderRaw = data.read_struct(0)?;
        if header.length == 0 {
            return None;
        }
        let is_last = header.flags & INDEX_ENTRY_LAST_IN_NODE != 0;
        let has_subnode = header.flags & INDEX_ENTRY_POINTS_TO_SUBNODE != 0;

        let key = if is_last || header.key_length == 0 {
            None
        } else {
            let prefix = std::mem::size_of::<IndexEntryHeaderRaw>();
            Some(data.slice(prefix, header.key_length as usize))
        };

        let child_vcn = if has_subnode {
            let vcn_offset = header.length as usize - 8;
            data.read_u64_le(vcn_offset)
        } else {
            None
        };

        Some((
            IndexEntry {
                file_reference: header.file_reference,
                key,
                child_vcn,
                is_last,
            },
            header.length,
        ))
    }
}

/// One node's worth of decoded entries, shared by an embedded $INDEX_ROOT
/// node and an on-disk IndexRecord's node.
#[derive(Debug, Clone)]
pub struct IndexNode {
    pub entries: Vec<IndexEntry>,
}

impl IndexNode {
    /// Decodes entries starting at `data`'s first byte being the node
    /// header (`IndexHeaderRaw`-shaped: offset/size/allocated/flags).
    pub fn decode(data: &DataBlock) -> Result<IndexNode, NtfsError> {
        let header: IndexHeaderRaw = data
            .read_struct(0)
            .ok_or_else(|| NtfsError::CorruptStructure("index node header too short".into()))?;
        if header.total_size as u64 > data.len() as u64 {
            return Err(NtfsError::CorruptStructure(
                "index node advertises more data than its block holds".into(),
            ));
        }

        let mut entries = Vec::new();
        let mut pos = header.entries_offset as usize;
        let end = header.total_size as usize;
        while pos < end {
            let view = data.slice_from(pos);
            match IndexEntry::decode(&view) {
                Some((entry, length)) => {
                    let is_last = entry.is_last;
                    entries.push(entry);
                    if is_last {
                        break;
                    }
                    pos += length as usize;
                }
                None => break,
            }
        }

        Ok(IndexNode { entries })
    }
}

/// A decoded $INDEX_ALLOCATION record: a fixed-up node plus its VCN.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub vcn: u64,
    pub node: IndexNode,
}

impl IndexRecord {
    /// Decodes one IndexRecord from a freshly-read, privately-owned buffer.
    /// Unlike the on-disk $DATA stream, IndexRecords carry their own USA
    /// fixup and must be verified exactly like FILE records.
    pub fn decode(mut buffer: Vec<u8>) -> Result<IndexRecord, NtfsError> {
        if buffer.len() < std::mem::size_of::<IndexRecordHeaderRaw>() {
            return Err(NtfsError::CorruptStructure("index record too short".into()));
        }
        let header: IndexRecordHeaderRaw = unsafe { structures::read_unaligned(&buffer, 0) };
        if header.magic != *structures::INDEX_RECORD_MAGIC {
            return Err(NtfsError::CorruptStructure(format!(
                "bad index record magic {:?}",
                header.magic
            )));
        }

        fixup::apply_fixup(&mut buffer, header.usa_offset, header.usa_count)?;

        let block = DataBlock::from_owned(buffer);
        let node_block = block.slice_from(std::mem::size_of::<IndexRecordHeaderRaw>());
        let node = IndexNode::decode(&node_block)?;

        Ok(IndexRecord {
            vcn: header.vcn,
            node,
        })
    }
}

/// Case-folding, code-point order comparison for the FILENAME collation
/// rule: NTFS sorts directory entries uppercase-first.
pub fn compare_filename_collation(a: &str, b: &str) -> std::cmp::Ordering {
    let ua = a.to_uppercase();
    let ub = b.to_uppercase();
    ua.chars().cmp(ub.chars())
}

/// Decodes a non-terminal entry's embedded stream as a $FILE_NAME payload.
/// Every index this crate reads ($I30 and $Extend's own index) is
/// FILENAME-collated, so the stream is always a $FILE_NAME attribute value,
/// as in the original's `AttrData_FILE_NAME{curEntry.stream}`.
fn entry_filename(entry: &IndexEntry) -> Option<Result<FileNameAttr, NtfsError>> {
    entry.key.as_ref().map(|key| attribute::parse_file_name(key))
}

/// Walks an index tree in order, invoking `visit(filename, file_reference)`
/// for every non-terminal entry. `load_child(vcn)` loads the IndexRecord at
/// a given VCN on demand. The terminal LAST_IN_NODE entry is never itself
/// emitted, but if it carries a subnode pointer that subtree is still
/// descended into so the rightmost branch is never dropped. An entry whose
/// stream doesn't decode as a $FILE_NAME is skipped rather than aborting
/// the whole traversal.
pub fn for_each<V, L>(root: &IndexNode, mut load_child: L, mut visit: V) -> Result<(), NtfsError>
where
    V: FnMut(&FileNameAttr, u64),
    L: FnMut(u64) -> Result<IndexRecord, NtfsError>,
{
    walk_node(root, &mut load_child, &mut visit)
}

fn walk_node<V, L>(node: &IndexNode, load_child: &mut L, visit: &mut V) -> Result<(), NtfsError>
where
    V: FnMut(&FileNameAttr, u64),
    L: FnMut(u64) -> Result<IndexRecord, NtfsError>,
{
    for entry in &node.entries {
        if let Some(vcn) = entry.child_vcn {
            let record = load_child(vcn)?;
            walk_node(&record.node, load_child, visit)?;
        }
        if !entry.is_last {
            match entry_filename(entry) {
                Some(Ok(fna)) => visit(&fna, entry.file_reference),
                Some(Err(e)) => log::warn!("skipping unreadable index entry: {}", e),
                None => {}
            }
        }
    }
    Ok(())
}

/// Descends the tree by collation order to find `name`'s target file
/// reference. Entries in a node are sorted ascending, with the terminal
/// entry (no key, conceptually +infinity) always last. Scanning forward,
/// the first entry whose filename is not less than `name` either matches
/// exactly or bounds the subtree to descend into; an entry with no subnode
/// pointer that fails to match means the name is absent. Only the FILENAME
/// collation rule is supported, since it's the only one this crate's
/// indexes ($I30, $Extend) ever use.
pub fn find<L>(root: &IndexNode, name: &str, collation_rule: u32, mut load_child: L) -> Result<Option<u64>, NtfsError>
where
    L: FnMut(u64) -> Result<IndexRecord, NtfsError>,
{
    if collation_rule != COLLATION_FILENAME {
        return Err(NtfsError::Unsupported(format!(
            "collation rule 0x{:x} is not FILENAME-based",
            collation_rule
        )));
    }
    find_in_node(root, name, &mut load_child)
}

fn find_in_node<L>(node: &IndexNode, name: &str, load_child: &mut L) -> Result<Option<u64>, NtfsError>
where
    L: FnMut(u64) -> Result<IndexRecord, NtfsError>,
{
    for entry in &node.entries {
        match entry_filename(entry) {
            Some(Ok(fna)) => match compare_filename_collation(name, &fna.name) {
                std::cmp::Ordering::Equal => return Ok(Some(entry.file_reference)),
                std::cmp::Ordering::Greater => continue,
                std::cmp::Ordering::Less => {
                    return match entry.child_vcn {
                        Some(vcn) => find_in_node(&load_child(vcn)?.node, name, load_child),
                        None => Ok(None),
                    };
                }
            },
            Some(Err(e)) => return Err(e),
            None => {
                return match entry.child_vcn {
                    Some(vcn) => find_in_node(&load_child(vcn)?.node, name, load_child),
                    None => Ok(None),
                };
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a 66-byte $FILE_NAME prefix followed by a UTF-16LE name, the
    /// shape every index entry's stream actually has on disk.
    fn file_name_stream(parent_reference: u64, name: &str) -> Vec<u8> {
        let name_utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let name_units = name.encode_utf16().count() as u8;
        let mut buf = vec![0u8; 66];
        buf[0..8].copy_from_slice(&parent_reference.to_le_bytes());
        buf[64] = name_units;
        buf[65] = structures::NAMESPACE_WIN32;
        buf.extend_from_slice(&name_utf16);
        buf
    }

    fn entry_bytes(file_reference: u64, flags: u16, key: &[u8], child_vcn: Option<u64>) -> Vec<u8> {
        let has_subnode = child_vcn.is_some();
        let flags = if has_subnode {
            flags | INDEX_ENTRY_POINTS_TO_SUBNODE
        } else {
            flags
        };
        let key_len = key.len();
        let base = std::mem::size_of::<IndexEntryHeaderRaw>();
        let mut length = base + key_len;
        if has_subnode {
            length = round_up_8(length + 8);
        } else {
            length = round_up_8(length);
        }
        let mut buf = vec![0u8; length];
        buf[0..8].copy_from_slice(&file_reference.to_le_bytes());
        buf[8..10].copy_from_slice(&(length as u16).to_le_bytes());
        buf[10..12].copy_from_slice(&(key_len as u16).to_le_bytes());
        buf[12..14].copy_from_slice(&flags.to_le_bytes());
        buf[base..base + key_len].copy_from_slice(key);
        if let Some(vcn) = child_vcn {
            let vcn_offset = length - 8;
            buf[vcn_offset..vcn_offset + 8].copy_from_slice(&vcn.to_le_bytes());
        }
        buf
    }

    fn round_up_8(n: usize) -> usize {
        (n + 7) & !7
    }

    fn single_leaf_node(entries: Vec<Vec<u8>>) -> Vec<u8> {
        let header_size = std::mem::size_of::<IndexHeaderRaw>();
        let mut body = Vec::new();
        for e in &entries {
            body.extend_from_slice(e);
        }
        let mut buf = vec![0u8; header_size];
        buf[0..4].copy_from_slice(&(header_size as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&((header_size + body.len()) as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&((header_size + body.len()) as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    #[test]
    fn for_each_emits_non_terminal_keys_only() {
        let e1 = entry_bytes(10, 0, &file_name_stream(5, "alpha"), None);
        let terminal = entry_bytes(0, INDEX_ENTRY_LAST_IN_NODE, b"", None);
        let bytes = single_leaf_node(vec![e1, terminal]);
        let block = DataBlock::from_owned(bytes);
        let node = IndexNode::decode(&block).unwrap();

        let mut visited = Vec::new();
        for_each(
            &node,
            |_vcn| unreachable!("no subnodes in this fixture"),
            |fna, frn| visited.push((fna.name.clone(), frn)),
        )
        .unwrap();

        assert_eq!(visited, vec![("alpha".to_string(), 10)]);
    }

    #[test]
    fn find_matches_exact_key() {
        let e1 = entry_bytes(10, 0, &file_name_stream(5, "alpha"), None);
        let e2 = entry_bytes(20, 0, &file_name_stream(5, "beta"), None);
        let terminal = entry_bytes(0, INDEX_ENTRY_LAST_IN_NODE, b"", None);
        let bytes = single_leaf_node(vec![e1, e2, terminal]);
        let block = DataBlock::from_owned(bytes);
        let node = IndexNode::decode(&block).unwrap();

        let found = find(&node, "beta", COLLATION_FILENAME, |_| unreachable!()).unwrap();
        assert_eq!(found, Some(20));
    }

    #[test]
    fn find_is_case_insensitive_over_real_file_name_stream() {
        let e1 = entry_bytes(10, 0, &file_name_stream(5, "Alpha"), None);
        let terminal = entry_bytes(0, INDEX_ENTRY_LAST_IN_NODE, b"", None);
        let bytes = single_leaf_node(vec![e1, terminal]);
        let block = DataBlock::from_owned(bytes);
        let node = IndexNode::decode(&block).unwrap();

        let found = find(&node, "ALPHA", COLLATION_FILENAME, |_| unreachable!()).unwrap();
        assert_eq!(found, Some(10));
    }
}
