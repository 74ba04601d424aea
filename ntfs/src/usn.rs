//! $UsnJrnl change journal reader (C10).

use ntfsx_core::{BlockDevice, NtfsError};

use crate::attribute::{AttributePayload, NonResidentPayload};
use crate::block::DataBlock;
use crate::index;
use crate::structures::{self, UsnJournalMaxRaw, UsnRecordHeaderRaw};
use crate::volume::Volume;

/// The `:Max` stream's fixed fields.
#[derive(Debug, Clone, Copy)]
pub struct UsnMax {
    pub maximum_size: u64,
    pub allocation_delta: u64,
    pub journal_id: u64,
    pub lowest_valid_usn: u64,
}

/// One decoded `:J` change-journal record.
#[derive(Debug, Clone)]
pub struct UsnRecord {
    pub offset_in_journal: u64,
    pub file_reference: u64,
    pub parent_file_reference: u64,
    pub usn: u64,
    pub timestamp: u64,
    pub reason: u32,
    pub source_info: u32,
    pub security_id: u32,
    pub file_attributes: u32,
    pub filename: String,
}

/// An open `$UsnJrnl`, located under `$Extend` (FRN 11).
pub struct UsnJournal<'v, D: BlockDevice> {
    volume: &'v mut Volume<D>,
    journal_frn: u64,
}

impl<'v, D: BlockDevice> UsnJournal<'v, D> {
    /// Locates `$UsnJrnl` by name in the directory index rooted at FRN 11.
    pub fn open(volume: &'v mut Volume<D>) -> Result<Self, NtfsError> {
        let extend = volume.extend_record()?;
        let index_root = extend
            .find_attr(structures::ATTR_INDEX_ROOT)
            .ok_or_else(|| NtfsError::CorruptStructure("$Extend has no $INDEX_ROOT".into()))?;
        let root_info = match &index_root.payload {
            AttributePayload::IndexRoot(info) => info,
            _ => return Err(NtfsError::CorruptStructure("$INDEX_ROOT payload mismatch".into())),
        };
        let node = index::IndexNode::decode(&root_info.node_block)?;

        let found = index::find(&node, "$UsnJrnl", root_info.collation_rule, |_vcn| {
            Err(NtfsError::Unsupported(
                "large $Extend directory indexes are not supported".into(),
            ))
        })?;

        let journal_frn = found
            .ok_or_else(|| NtfsError::CorruptStructure("$UsnJrnl not found under $Extend".into()))?
            & 0x0000_FFFF_FFFF_FFFF;

        Ok(UsnJournal { volume, journal_frn })
    }

    fn journal_record(&mut self) -> Result<crate::file_record::FileRecord, NtfsError> {
        self.volume.read_record(self.journal_frn)
    }

    /// Decodes the `:Max` stream.
    pub fn max(&mut self) -> Result<UsnMax, NtfsError> {
        let record = self.journal_record()?;
        let attr = record
            .find_attr_named(structures::ATTR_DATA, "$Max")
            .ok_or_else(|| NtfsError::CorruptStructure("$UsnJrnl has no $Max stream".into()))?;
        let bytes = match &attr.payload {
            AttributePayload::ResidentData(block) => block.copy(),
            AttributePayload::NonResidentData(nr) => self.read_non_resident(nr, 0, std::mem::size_of::<UsnJournalMaxRaw>() as u64)?,
            _ => return Err(NtfsError::CorruptStructure("$Max has unexpected payload shape".into())),
        };
        let block = DataBlock::from_owned(bytes);
        let raw: UsnJournalMaxRaw = block
            .read_struct(0)
            .ok_or_else(|| NtfsError::CorruptStructure("$Max stream too short".into()))?;
        Ok(UsnMax {
            maximum_size: raw.maximum_size,
            allocation_delta: raw.allocation_delta,
            journal_id: raw.journal_id,
            lowest_valid_usn: raw.lowest_valid_usn,
        })
    }

    fn j_stream(&mut self) -> Result<NonResidentPayload, NtfsError> {
        let record = self.journal_record()?;
        let attr = record
            .find_attr_named(structures::ATTR_DATA, "$J")
            .ok_or_else(|| NtfsError::CorruptStructure("$UsnJrnl has no $J stream".into()))?;
        match &attr.payload {
            AttributePayload::NonResidentData(nr) => Ok(nr.clone()),
            _ => Err(NtfsError::CorruptStructure("$J must be non-resident".into())),
        }
    }

    fn read_non_resident(&mut self, nr: &NonResidentPayload, offset: u64, length: u64) -> Result<Vec<u8>, NtfsError> {
        let sectors_per_cluster = self.volume.boot_sector().sectors_per_cluster as u64;
        let extents = nr.sector_extents(sectors_per_cluster)?;
        self.volume.read_attribute_range(&extents, offset, length)
    }

    /// Reads and decodes all entries in the cluster at virtual cluster
    /// number `vcn`, stopping at the first record whose recorded offset
    /// does not match the running offset (padding, or end of cluster).
    pub fn logs_at_vcn(&mut self, vcn: u64) -> Result<Vec<UsnRecord>, NtfsError> {
        let j = self.j_stream()?;
        if vcn < j.vcn_start || vcn > j.vcn_end {
            return Ok(Vec::new());
        }
        let cluster_size = self.volume.boot_sector().cluster_size() as u64;
        let offset = vcn * cluster_size;
        let bytes = self.read_non_resident(&j, offset, cluster_size)?;
        Ok(decode_entries(&bytes, offset))
    }

    /// Walks backward whole clusters from the end of `:J`, prepending each
    /// cluster's in-order entries, trimming to the newest `n` once more
    /// than `n` have accumulated.
    pub fn last_n(&mut self, n: u64) -> Result<Vec<UsnRecord>, NtfsError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let j = self.j_stream()?;
        let cluster_size = self.volume.boot_sector().cluster_size() as u64;
        let clusters = j.real_size.div_ceil(cluster_size);
        if clusters == 0 {
            return Ok(Vec::new());
        }

        let mut result: Vec<UsnRecord> = Vec::new();
        let mut cluster_index = clusters - 1;
        loop {
            let vcn = j.vcn_start + cluster_index;
            let mut entries = self.logs_at_vcn(vcn)?;
            entries.extend(result);
            result = entries;

            if result.len() as u64 > n {
                let drop = result.len() as u64 - n;
                result.drain(0..drop as usize);
            }
            if result.len() as u64 >= n || cluster_index == 0 {
                break;
            }
            cluster_index -= 1;
        }
        Ok(result)
    }
}

fn decode_entries(data: &[u8], base_offset: u64) -> Vec<UsnRecord> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    let block = DataBlock::from_owned(data.to_vec());
    while pos + std::mem::size_of::<UsnRecordHeaderRaw>() <= block.len() {
        let view = block.slice_from(pos);
        let header: UsnRecordHeaderRaw = match view.read_struct(0) {
            Some(h) => h,
            None => break,
        };
        if header.size_of_entry == 0 {
            break;
        }
        // The USN field doubles as this record's byte offset within $J; a
        // mismatch means we've hit padding or the cluster's tail.
        let recorded_offset = base_offset + pos as u64;
        if header.usn != recorded_offset {
            break;
        }
        let expected_size = round_up_8(header.filename_offset as u32 + header.filename_length as u32);
        if header.size_of_entry != expected_size {
            break;
        }

        let name = view
            .read_utf16le(header.filename_offset as usize, header.filename_length as usize / 2)
            .unwrap_or_default();

        entries.push(UsnRecord {
            offset_in_journal: recorded_offset,
            file_reference: header.file_reference & 0x0000_FFFF_FFFF_FFFF,
            parent_file_reference: header.parent_file_reference & 0x0000_FFFF_FFFF_FFFF,
            usn: header.usn,
            timestamp: header.timestamp,
            reason: header.reason,
            source_info: header.source_info,
            security_id: header.security_id,
            file_attributes: header.file_attributes,
            filename: name,
        });

        pos += header.size_of_entry as usize;
    }
    entries
}

fn round_up_8(n: u32) -> u32 {
    (n + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds one `:J` entry whose `usn` field is its own offset within the
    /// stream, as real NTFS journals always encode it.
    fn usn_entry(file_ref: u64, offset: u64, name: &str) -> Vec<u8> {
        let name_utf16: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let header_size = std::mem::size_of::<UsnRecordHeaderRaw>();
        let size = round_up_8((header_size + name_utf16.len()) as u32);
        let mut buf = vec![0u8; size as usize];
        buf[0..4].copy_from_slice(&size.to_le_bytes());
        buf[8..16].copy_from_slice(&file_ref.to_le_bytes());
        buf[24..32].copy_from_slice(&offset.to_le_bytes());
        buf[56..58].copy_from_slice(&(name_utf16.len() as u16).to_le_bytes());
        buf[58..60].copy_from_slice(&(header_size as u16).to_le_bytes());
        buf[header_size..header_size + name_utf16.len()].copy_from_slice(&name_utf16);
        buf
    }

    #[test]
    fn decodes_entries_until_padding() {
        let first = usn_entry(5, 0, "a.txt");
        let second_offset = first.len() as u64;
        let mut bytes = first;
        bytes.extend_from_slice(&usn_entry(6, second_offset, "b.txt"));
        let entries = decode_entries(&bytes, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "a.txt");
        assert_eq!(entries[1].usn, second_offset);
    }

    #[test]
    fn stops_at_zeroed_padding() {
        let mut bytes = usn_entry(5, 0, "a.txt");
        bytes.extend_from_slice(&[0u8; 64]);
        let entries = decode_entries(&bytes, 0);
        assert_eq!(entries.len(), 1);
    }
}
