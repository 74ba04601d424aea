//! FILE record decode: fixup, attribute iteration, and $ATTRIBUTE_LIST-driven
//! extension-record chaining (C7).

use ntfsx_core::NtfsError;

use crate::attribute::{decode_attribute, Attribute, AttributePayload};
use crate::block::DataBlock;
use crate::fixup;
use crate::structures::{self, FileRecordHeaderRaw, FILE_RECORD_IS_DIRECTORY, FILE_RECORD_IN_USE};

/// One decoded attribute plus the index of the attribute loaded immediately
/// before it, used to resolve "previous attribute" relatives across
/// extension records (e.g. $INDEX_ALLOCATION needing its $INDEX_ROOT).
#[derive(Debug, Clone)]
struct AttributeSlot {
    attr: Attribute,
    previous: Option<usize>,
}

/// A decoded FILE record, with attributes from any chained extension
/// records folded in.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub record_number: u64,
    pub sequence_number: u16,
    pub link_count: u16,
    pub flags: u16,
    pub real_size: u32,
    pub allocated_size: u32,
    pub base_file_reference: u64,
    attributes: Vec<AttributeSlot>,
}

impl FileRecord {
    pub fn is_in_use(&self) -> bool {
        self.flags & FILE_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_RECORD_IS_DIRECTORY != 0
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().map(|s| &s.attr)
    }

    /// First attribute matching `type_code`, forward scan.
    pub fn find_attr(&self, type_code: u32) -> Option<&Attribute> {
        self.attributes.iter().find(|s| s.attr.type_code == type_code).map(|s| &s.attr)
    }

    pub fn find_all_attrs(&self, type_code: u32) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|s| s.attr.type_code == type_code)
            .map(|s| &s.attr)
            .collect()
    }

    /// First attribute matching both `type_code` and a named stream, e.g.
    /// `$DATA` named `$J` or `$Max`.
    pub fn find_attr_named(&self, type_code: u32, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|s| s.attr.type_code == type_code && s.attr.name.as_deref() == Some(name))
            .map(|s| &s.attr)
    }

    /// Exact match by attribute id. Walks the previous-pointer chain so
    /// attributes loaded from extension records are reachable.
    pub fn attr_by_id(&self, id: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|s| s.attr.attribute_id == id).map(|s| &s.attr)
    }

    /// The attribute immediately preceding `attr` in decode order, if any.
    pub fn previous_of<'a>(&'a self, attr: &Attribute) -> Option<&'a Attribute> {
        let idx = self
            .attributes
            .iter()
            .position(|s| std::ptr::eq(&s.attr, attr))?;
        let prev = self.attributes[idx].previous?;
        self.attributes.get(prev).map(|s| &s.attr)
    }

    /// The first $FILE_NAME payload's name, or empty if none decoded.
    pub fn filename(&self) -> String {
        self.attributes
            .iter()
            .find_map(|s| match &s.attr.payload {
                AttributePayload::FileName(fname) => Some(fname.name.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// The parent directory file reference from the first $FILE_NAME
    /// attribute, if any.
    pub fn parent_reference(&self) -> Option<u64> {
        self.attributes.iter().find_map(|s| match &s.attr.payload {
            AttributePayload::FileName(fname) => Some(fname.parent_reference),
            _ => None,
        })
    }
}

/// Decodes the header and attribute sequence of a single FILE record from
/// `buffer`, without following $ATTRIBUTE_LIST extension records. `buffer`
/// must be a private, freshly-read copy: fixup mutates it in place.
pub fn decode_base_record(mut buffer: Vec<u8>) -> Result<FileRecord, NtfsError> {
    if buffer.len() < std::mem::size_of::<FileRecordHeaderRaw>() {
        return Err(NtfsError::CorruptStructure("FILE record too short".into()));
    }

    let header: FileRecordHeaderRaw = unsafe { structures::read_unaligned(&buffer, 0) };
    if header.magic != *structures::FILE_RECORD_MAGIC {
        return Err(NtfsError::CorruptStructure(format!(
            "bad FILE record magic {:?}",
            header.magic
        )));
    }

    fixup::apply_fixup(&mut buffer, header.usa_offset, header.usa_count).map_err(|_| {
        NtfsError::FixupMismatch {
            frn: header.record_number as u64,
        }
    })?;

    let block = DataBlock::from_owned(buffer);
    let attrs_offset = header.attrs_offset as usize;
    let real_size = (header.real_size as usize).min(block.len());
    let region = block.slice(attrs_offset, real_size.saturating_sub(attrs_offset));

    let mut attributes = Vec::new();
    let mut pos = 0usize;
    let mut previous = None;
    while pos < region.len() {
        let view = region.slice_from(pos);
        match decode_attribute(&view) {
            Ok(Some((attr, length))) => {
                if length == 0 {
                    break;
                }
                attributes.push(AttributeSlot { attr, previous });
                previous = Some(attributes.len() - 1);
                pos += length as usize;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    Ok(FileRecord {
        record_number: header.record_number as u64,
        sequence_number: header.sequence_number,
        link_count: header.link_count,
        flags: header.flags,
        real_size: header.real_size,
        allocated_size: header.allocated_size,
        base_file_reference: header.base_file_reference,
        attributes,
    })
}

/// Merges extension-record attributes, driven by any $ATTRIBUTE_LIST found
/// in `base`. `load_record` reads and decodes a FILE record by file
/// reference number; it is expected to be `Volume::read_record` wired in by
/// the caller, kept generic here to avoid a dependency cycle.
pub fn resolve_extension_records<F>(
    mut base: FileRecord,
    mut load_record: F,
) -> Result<FileRecord, NtfsError>
where
    F: FnMut(u64) -> Result<FileRecord, NtfsError>,
{
    let list_entries: Vec<u64> = base
        .attributes()
        .filter_map(|attr| match &attr.payload {
            AttributePayload::AttributeList(entries) => Some(entries.clone()),
            _ => None,
        })
        .flatten()
        .map(|e| e.base_file_reference & 0x0000_FFFF_FFFF_FFFF)
        .filter(|&frn| frn != base.record_number)
        .collect();

    let mut seen = std::collections::HashSet::new();
    for frn in list_entries {
        if !seen.insert(frn) {
            continue;
        }
        let extension = load_record(frn)?;
        let offset = base.attributes.len();
        for slot in extension.attributes {
            base.attributes.push(AttributeSlot {
                attr: slot.attr,
                previous: slot.previous.map(|p| p + offset).or_else(|| {
                    if offset == 0 {
                        None
                    } else {
                        Some(offset - 1)
                    }
                }),
            });
        }
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_record() -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[0..4].copy_from_slice(structures::FILE_RECORD_MAGIC);
        buf[4..6].copy_from_slice(&0x30u16.to_le_bytes()); // usa_offset
        buf[6..8].copy_from_slice(&3u16.to_le_bytes()); // usa_count
        buf[16..18].copy_from_slice(&1u16.to_le_bytes()); // sequence_number
        buf[18..20].copy_from_slice(&1u16.to_le_bytes()); // link_count
        buf[20..22].copy_from_slice(&56u16.to_le_bytes()); // attrs_offset
        buf[22..24].copy_from_slice(&FILE_RECORD_IN_USE.to_le_bytes());
        buf[24..28].copy_from_slice(&1024u32.to_le_bytes()); // real_size
        buf[28..32].copy_from_slice(&1024u32.to_le_bytes()); // allocated_size

        // USA sentinel + values so fixup passes for both 512-byte sectors.
        buf[0x30] = 0x01;
        buf[0x31] = 0x00;
        buf[0x32] = 0xAA;
        buf[0x33] = 0xBB;
        buf[0x34] = 0xCC;
        buf[0x35] = 0xDD;
        buf[510] = 0x01;
        buf[511] = 0x00;
        buf[1022] = 0x01;
        buf[1023] = 0x00;

        // end-of-attributes terminator at offset 56.
        buf[56..60].copy_from_slice(&structures::ATTR_END.to_le_bytes());
        buf
    }

    #[test]
    fn decodes_empty_record_with_fixup() {
        let record = decode_base_record(minimal_record()).unwrap();
        assert!(record.is_in_use());
        assert!(!record.is_directory());
        assert_eq!(record.attributes().count(), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = minimal_record();
        buf[0] = b'X';
        assert!(decode_base_record(buf).is_err());
    }

    #[test]
    fn rejects_fixup_mismatch() {
        let mut buf = minimal_record();
        buf[510] = 0x02; // corrupt sentinel
        assert!(matches!(
            decode_base_record(buf),
            Err(NtfsError::FixupMismatch { .. })
        ));
    }
}
