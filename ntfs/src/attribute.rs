//! Attribute header decode and typed payload decoders (C5/C6).

use ntfsx_core::NtfsError;

use crate::block::DataBlock;
use crate::data_runs::{self, SectorExtent};
use crate::structures::{
    self, AttributeHeaderRaw, AttributeListEntryRaw, FileNamePrefixRaw, IndexRootPrefixRaw,
    NonResidentHeaderRaw, ResidentHeaderRaw, StandardInformationExtraRaw, StandardInformationRaw,
};

/// One decoded $ATTRIBUTE_LIST entry.
#[derive(Debug, Clone)]
pub struct AttributeListEntry {
    pub attribute_type: u32,
    pub name: Option<String>,
    pub starting_vcn: u64,
    pub base_file_reference: u64,
    pub attribute_id: u16,
}

/// $STANDARD_INFORMATION payload.
#[derive(Debug, Clone, Copy)]
pub struct StandardInformation {
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub dos_permissions: u32,
    pub owner_id: Option<u32>,
    pub security_id: Option<u32>,
    pub quota_charged: Option<u64>,
    pub usn: Option<u64>,
}

/// $FILE_NAME payload.
#[derive(Debug, Clone)]
pub struct FileNameAttr {
    pub parent_reference: u64,
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: u8,
    pub name: String,
}

/// $INDEX_ROOT's fixed prefix plus the embedded root node's raw bytes.
#[derive(Debug, Clone)]
pub struct IndexRootInfo {
    pub indexed_attribute_type: u32,
    pub collation_rule: u32,
    pub index_block_size: u32,
    pub node_block: DataBlock,
}

/// The non-resident shape shared by $DATA and $INDEX_ALLOCATION.
#[derive(Debug, Clone)]
pub struct NonResidentPayload {
    pub runs: DataBlock,
    pub vcn_start: u64,
    pub vcn_end: u64,
    pub compression_unit: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub initialized_size: u64,
}

impl NonResidentPayload {
    pub fn vcn_count(&self) -> u64 {
        self.vcn_end + 1 - self.vcn_start
    }

    pub fn sector_extents(&self, sectors_per_cluster: u64) -> Result<Vec<SectorExtent>, NtfsError> {
        data_runs::materialize_to_sectors(&self.runs, self.vcn_count(), sectors_per_cluster)
    }
}

/// The decoded, typed body of an attribute.
#[derive(Debug, Clone)]
pub enum AttributePayload {
    StandardInformation(StandardInformation),
    AttributeList(Vec<AttributeListEntry>),
    FileName(FileNameAttr),
    ResidentData(DataBlock),
    NonResidentData(NonResidentPayload),
    IndexRoot(IndexRootInfo),
    IndexAllocation(NonResidentPayload),
    Bitmap(DataBlock),
    VolumeName(String),
    Raw(DataBlock),
}

/// A fully decoded attribute: common header fields plus its typed payload.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub type_code: u32,
    pub length: u32,
    pub non_resident: bool,
    pub name: Option<String>,
    pub attribute_id: u16,
    pub indexed: bool,
    pub payload: AttributePayload,
}

/// Decodes one attribute starting at offset 0 of `block`. `block` should be
/// a view from the attribute's header to the end of the containing record.
///
/// Returns `Ok(None)` at the end-of-attributes terminator or a zero-length
/// header, which callers use as the iteration stop condition.
pub fn decode_attribute(block: &DataBlock) -> Result<Option<(Attribute, u32)>, NtfsError> {
    if block.len() < 4 {
        return Ok(None);
    }
    let type_code = block
        .read_u32_le(0)
        .ok_or_else(|| NtfsError::CorruptStructure("attribute header truncated".into()))?;
    if type_code == structures::ATTR_END {
        return Ok(None);
    }

    let header: AttributeHeaderRaw = block
        .read_struct(0)
        .ok_or_else(|| NtfsError::CorruptStructure("attribute header truncated".into()))?;
    if header.length == 0 || header.type_code > structures::ATTR_LOGGED_UTILITY_STREAM {
        return Ok(None);
    }
    if header.non_resident > 1 {
        let non_resident = header.non_resident;
        let type_code = header.type_code;
        return Err(NtfsError::CorruptStructure(format!(
            "invalid non_resident flag {} on attribute 0x{:x}",
            non_resident, type_code
        )));
    }

    let name = if header.name_length > 0 {
        block.read_utf16le(header.name_offset as usize, header.name_length as usize)
    } else {
        None
    };

    let (payload, indexed, actual_length) = if header.non_resident == 0 {
        let res: ResidentHeaderRaw = block
            .read_struct(0)
            .ok_or_else(|| NtfsError::CorruptStructure("resident header truncated".into()))?;
        let value = block.slice(res.value_offset as usize, res.value_length as usize);
        let payload = decode_resident_payload(header.type_code, &value)?;
        let actual_length = res.value_offset as u32 + res.value_length;
        (payload, res.indexed_flag != 0, actual_length)
    } else {
        let nr: NonResidentHeaderRaw = block
            .read_struct(0)
            .ok_or_else(|| NtfsError::CorruptStructure("non-resident header truncated".into()))?;
        let runs = block.slice_from(nr.data_runs_offset as usize);
        let run_list_bytes = data_runs::walk_runs(&runs, |_| true) as u32;
        let non_resident = NonResidentPayload {
            runs,
            vcn_start: nr.vcn_start,
            vcn_end: nr.vcn_end,
            compression_unit: nr.compression_unit,
            allocated_size: nr.allocated_size,
            real_size: nr.real_size,
            initialized_size: nr.initialized_size,
        };
        let payload = match header.type_code {
            structures::ATTR_INDEX_ALLOCATION => AttributePayload::IndexAllocation(non_resident),
            _ => AttributePayload::NonResidentData(non_resident),
        };
        let actual_length = nr.data_runs_offset as u32 + run_list_bytes;
        (payload, false, actual_length)
    };

    // Re-derive the attribute's length from what was actually read; correct
    // it if the header lied and overran the enclosing block.
    let derived_length = round_up_8(actual_length);
    let length = if (header.length as u64) > block.len() as u64 {
        derived_length
    } else {
        header.length
    };

    let attr = Attribute {
        type_code: header.type_code,
        length,
        non_resident: header.non_resident != 0,
        name,
        attribute_id: header.attribute_id,
        indexed,
        payload,
    };
    Ok(Some((attr, length)))
}

fn round_up_8(n: u32) -> u32 {
    (n + 7) & !7
}

fn decode_resident_payload(type_code: u32, value: &DataBlock) -> Result<AttributePayload, NtfsError> {
    match type_code {
        structures::ATTR_STANDARD_INFORMATION => decode_standard_information(value),
        structures::ATTR_ATTRIBUTE_LIST => decode_attribute_list(value),
        structures::ATTR_FILE_NAME => decode_file_name(value),
        structures::ATTR_DATA => Ok(AttributePayload::ResidentData(value.clone())),
        structures::ATTR_INDEX_ROOT => decode_index_root(value),
        structures::ATTR_BITMAP => Ok(AttributePayload::Bitmap(value.clone())),
        structures::ATTR_VOLUME_NAME => {
            let units = value.len() / 2;
            let name = value.read_utf16le(0, units).unwrap_or_default();
            Ok(AttributePayload::VolumeName(name))
        }
        _ => Ok(AttributePayload::Raw(value.clone())),
    }
}

fn decode_standard_information(value: &DataBlock) -> Result<AttributePayload, NtfsError> {
    let fixed: StandardInformationRaw = value
        .read_struct(0)
        .ok_or_else(|| NtfsError::CorruptStructure("$STANDARD_INFORMATION too short".into()))?;
    let extra: Option<StandardInformationExtraRaw> =
        value.read_struct(std::mem::size_of::<StandardInformationRaw>());
    Ok(AttributePayload::StandardInformation(StandardInformation {
        created: fixed.created,
        modified: fixed.modified,
        mft_modified: fixed.mft_modified,
        accessed: fixed.accessed,
        dos_permissions: fixed.dos_permissions,
        owner_id: extra.map(|e| e.owner_id),
        security_id: extra.map(|e| e.security_id),
        quota_charged: extra.map(|e| e.quota_charged),
        usn: extra.map(|e| e.usn),
    }))
}

fn decode_attribute_list(value: &DataBlock) -> Result<AttributePayload, NtfsError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + std::mem::size_of::<AttributeListEntryRaw>() <= value.len() {
        let raw: AttributeListEntryRaw = match value.read_struct(pos) {
            Some(r) => r,
            None => break,
        };
        if raw.record_length == 0 {
            break;
        }
        let name = if raw.name_length > 0 {
            value.read_utf16le(pos + raw.name_offset as usize, raw.name_length as usize)
        } else {
            None
        };
        entries.push(AttributeListEntry {
            attribute_type: raw.attribute_type,
            name,
            starting_vcn: raw.starting_vcn,
            base_file_reference: raw.base_file_reference,
            attribute_id: raw.attribute_id,
        });
        pos += raw.record_length as usize;
    }
    Ok(AttributePayload::AttributeList(entries))
}

fn decode_file_name(value: &DataBlock) -> Result<AttributePayload, NtfsError> {
    parse_file_name(value).map(AttributePayload::FileName)
}

/// Parses a $FILE_NAME attribute's value: the 66-byte binary prefix (parent
/// FRN, four timestamps, alloc/real size, flags, namespace) followed by the
/// UTF-16LE name. This is also the shape of the "stream" embedded in every
/// entry of a FILENAME-collated directory index, so index and USN-journal
/// lookups decode their entry keys through this same parser.
pub fn parse_file_name(value: &DataBlock) -> Result<FileNameAttr, NtfsError> {
    let prefix: FileNamePrefixRaw = value
        .read_struct(0)
        .ok_or_else(|| NtfsError::CorruptStructure("$FILE_NAME too short".into()))?;
    let name_offset = std::mem::size_of::<FileNamePrefixRaw>();
    let name_len = prefix.filename_length as usize;
    let name = value
        .read_utf16le(name_offset, name_len)
        .ok_or_else(|| NtfsError::CorruptStructure("$FILE_NAME name beyond buffer".into()))?;
    Ok(FileNameAttr {
        parent_reference: prefix.parent_reference,
        created: prefix.created,
        modified: prefix.modified,
        mft_modified: prefix.mft_modified,
        accessed: prefix.accessed,
        allocated_size: prefix.allocated_size,
        real_size: prefix.real_size,
        flags: prefix.flags,
        namespace: prefix.namespace,
        name,
    })
}

fn decode_index_root(value: &DataBlock) -> Result<AttributePayload, NtfsError> {
    let prefix: IndexRootPrefixRaw = value
        .read_struct(0)
        .ok_or_else(|| NtfsError::CorruptStructure("$INDEX_ROOT too short".into()))?;
    let node_block = value.slice_from(std::mem::size_of::<IndexRootPrefixRaw>());
    Ok(AttributePayload::IndexRoot(IndexRootInfo {
        indexed_attribute_type: prefix.attribute_type,
        collation_rule: prefix.collation_rule,
        index_block_size: prefix.index_block_size,
        node_block,
    }))
}

/// $BITMAP query primitives.
pub struct Bitmap<'a> {
    data: &'a DataBlock,
}

impl<'a> Bitmap<'a> {
    pub fn new(data: &'a DataBlock) -> Self {
        Self { data }
    }

    pub fn test(&self, pos: u64) -> bool {
        let byte_index = (pos / 8) as usize;
        let bit_index = (pos % 8) as u32;
        match self.data.get(byte_index) {
            Some(byte) => byte & (1 << bit_index) != 0,
            None => false,
        }
    }

    pub fn find_first_free(&self) -> Option<u64> {
        for i in 0..self.data.len() {
            let byte = self.data.get(i).unwrap();
            if byte != 0xFF {
                for bit in 0..8u32 {
                    if byte & (1 << bit) == 0 {
                        return Some((i as u64) * 8 + bit as u64);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resident_attr_header(type_code: u32, value: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 24];
        buf[0..4].copy_from_slice(&type_code.to_le_bytes());
        let total_len = round_up_8(24 + value.len() as u32);
        buf[4..8].copy_from_slice(&total_len.to_le_bytes());
        buf[8] = 0; // resident
        buf[14..16].copy_from_slice(&0u16.to_le_bytes()); // attribute_id
        buf[16..20].copy_from_slice(&(value.len() as u32).to_le_bytes()); // value_length
        buf[20..22].copy_from_slice(&24u16.to_le_bytes()); // value_offset
        buf.extend_from_slice(value);
        buf.resize(total_len as usize, 0);
        buf
    }

    #[test]
    fn decodes_resident_data_attribute() {
        let value = b"hello ntfs";
        let bytes = resident_attr_header(structures::ATTR_DATA, value);
        let block = DataBlock::from_owned(bytes);
        let (attr, _len) = decode_attribute(&block).unwrap().unwrap();
        match attr.payload {
            AttributePayload::ResidentData(data) => assert_eq!(data.as_slice(), value),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn end_terminator_yields_none() {
        let bytes = structures::ATTR_END.to_le_bytes().to_vec();
        let block = DataBlock::from_owned(bytes);
        assert!(decode_attribute(&block).unwrap().is_none());
    }

    #[test]
    fn bitmap_finds_first_free_bit() {
        let block = DataBlock::from_owned(vec![0b1111_1110, 0xFF]);
        let bitmap = Bitmap::new(&block);
        assert!(!bitmap.test(0));
        assert!(bitmap.test(1));
        assert_eq!(bitmap.find_first_free(), Some(0));
    }
}
