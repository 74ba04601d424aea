//! Volume open sequence and the VCN/VSN/LSN translation primitives (C9).

use std::path::Path;

use log::warn;
use ntfsx_core::{BlockDevice, FileBlockDevice, NtfsError};

use crate::attribute::AttributePayload;
use crate::block::DataBlock;
use crate::boot_sector::BootSector;
use crate::data_runs::SectorExtent;
use crate::file_record::{self, FileRecord};
use crate::structures::{self, FRN_EXTEND, FRN_MFT, FRN_ROOT};

/// An open NTFS volume: boot geometry, the live MFT extent map, and the
/// backing block device.
pub struct Volume<D: BlockDevice> {
    device: D,
    boot: BootSector,
    mft_runs: Vec<SectorExtent>,
    file_record_size: u32,
    file_record_count: u64,
}

impl Volume<FileBlockDevice> {
    /// Opens a volume from a raw device or image file path, assuming the
    /// conventional 512-byte NTFS sector size.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, NtfsError> {
        Self::open_path_with_sector_size(path, 512)
    }

    /// Opens a volume from a raw device or image file path using an
    /// explicit sector size, for images whose boot sector is absent or
    /// untrustworthy.
    pub fn open_path_with_sector_size<P: AsRef<Path>>(path: P, sector_size: u32) -> Result<Self, NtfsError> {
        let device = FileBlockDevice::open(path, sector_size)?;
        Self::open(device)
    }
}

impl<D: BlockDevice> Volume<D> {
    pub fn open(mut device: D) -> Result<Self, NtfsError> {
        let sector_size = device.sector_size();
        let boot_sectors = (512u32).div_ceil(sector_size).max(1);
        let boot_bytes = device.read_sectors(0, boot_sectors as u64)?;
        let boot = BootSector::parse(&DataBlock::from_owned(boot_bytes))?;

        let secs_per_file_record = (boot.file_record_size / boot.bytes_per_sector).max(1) as u64;
        let mft_start_sector = boot.mft_lcn * boot.sectors_per_cluster as u64;
        let mft_bytes = device.read_sectors(mft_start_sector, secs_per_file_record)?;
        let mft_record = file_record::decode_base_record(mft_bytes)?;

        let data_attr = mft_record
            .find_attr(structures::ATTR_DATA)
            .ok_or_else(|| NtfsError::CorruptStructure("$MFT record has no $DATA".into()))?;
        let non_resident = match &data_attr.payload {
            AttributePayload::NonResidentData(nr) => nr,
            _ => {
                return Err(NtfsError::CorruptStructure(
                    "$MFT $DATA must be non-resident".into(),
                ))
            }
        };
        let mft_runs = non_resident.sector_extents(boot.sectors_per_cluster as u64)?;

        let file_record_size = mft_record.allocated_size;
        if file_record_size != boot.file_record_size {
            warn!(
                "boot sector file_record_size hint {} disagrees with live $MFT allocated_size {}",
                boot.file_record_size, file_record_size
            );
        }
        let total_mft_bytes: u64 = mft_runs.iter().map(|e| e.count * boot.bytes_per_sector as u64).sum();
        let file_record_count = total_mft_bytes / file_record_size as u64;

        Ok(Volume {
            device,
            boot,
            mft_runs,
            file_record_size,
            file_record_count,
        })
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn file_record_size(&self) -> u32 {
        self.file_record_size
    }

    pub fn file_record_count(&self) -> u64 {
        self.file_record_count
    }

    fn sectors_per_record(&self) -> u64 {
        (self.file_record_size / self.boot.bytes_per_sector).max(1) as u64
    }

    /// The sector ranges holding the FILE record for `frn`.
    pub fn record_area_for_frn(&self, frn: u64) -> Result<Vec<SectorExtent>, NtfsError> {
        if frn >= self.file_record_count {
            return Err(NtfsError::RangeRequest {
                offset: frn,
                length: 1,
            });
        }
        let secs = self.sectors_per_record();
        let vsn = frn * secs;
        vsn_to_lsn(&self.mft_runs, vsn, secs)
    }

    /// Reads and decodes the FILE record for `frn`, following
    /// $ATTRIBUTE_LIST extension records.
    pub fn read_record(&mut self, frn: u64) -> Result<FileRecord, NtfsError> {
        let extents = self.record_area_for_frn(frn)?;
        let buffer = self.read_extents(&extents)?;
        let base = file_record::decode_base_record(buffer)?;
        file_record::resolve_extension_records(base, |ext_frn| self.read_record(ext_frn))
    }

    fn read_extents(&mut self, extents: &[SectorExtent]) -> Result<Vec<u8>, NtfsError> {
        let mut buffer = Vec::new();
        for extent in extents {
            match extent.start {
                Some(start) => {
                    let sectors = self.device.read_sectors(start, extent.count)?;
                    buffer.extend_from_slice(&sectors);
                }
                None => {
                    buffer.resize(buffer.len() + (extent.count * self.boot.bytes_per_sector as u64) as usize, 0);
                }
            }
        }
        Ok(buffer)
    }

    /// Reads the requested byte range of a (possibly non-resident)
    /// attribute, trimming partial leading/trailing sectors and
    /// zero-filling sparse runs without issuing a device read for them.
    pub fn read_attribute_range(
        &mut self,
        extents: &[SectorExtent],
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, NtfsError> {
        let sector_size = self.boot.bytes_per_sector as u64;
        let start_sector = offset / sector_size;
        let end_sector = (offset + length).div_ceil(sector_size);
        let requested = end_sector - start_sector;

        let covering = vsn_to_lsn(extents, start_sector, requested)?;
        let raw = self.read_extents(&covering)?;

        let skip = (offset % sector_size) as usize;
        let take = length as usize;
        if skip + take > raw.len() {
            return Err(NtfsError::RangeRequest { offset, length });
        }
        Ok(raw[skip..skip + take].to_vec())
    }

    /// Resolves the full path of `record`'s first $FILE_NAME ancestry,
    /// stopping at the root directory (FRN 5) or the sentinel FRN 0.
    pub fn path_of(&mut self, record: &FileRecord) -> Result<String, NtfsError> {
        let mut components = vec![record.filename()];
        let mut parent = record.parent_reference().map(|r| r & 0x0000_FFFF_FFFF_FFFF);

        let mut guard = 0usize;
        while let Some(frn) = parent {
            if frn == FRN_ROOT || frn == FRN_MFT {
                break;
            }
            guard += 1;
            if guard > self.file_record_count as usize {
                return Err(NtfsError::CorruptStructure(
                    "path resolution exceeded the record count; likely a cycle".into(),
                ));
            }
            let ancestor = self.read_record(frn)?;
            components.push(ancestor.filename());
            parent = ancestor.parent_reference().map(|r| r & 0x0000_FFFF_FFFF_FFFF);
        }

        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Locates `$Extend` (FRN 11), required to reach `$UsnJrnl`.
    pub fn extend_record(&mut self) -> Result<FileRecord, NtfsError> {
        self.read_record(FRN_EXTEND)
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

/// Converts decoded data runs for a non-resident attribute into physical
/// sector extents. Thin wrapper kept for symmetry with `vsn_to_lsn`; the
/// actual materialization lives in `NonResidentPayload::sector_extents`.
pub fn data_runs_to_sectors(runs: &crate::attribute::NonResidentPayload, sectors_per_cluster: u64) -> Result<Vec<SectorExtent>, NtfsError> {
    runs.sector_extents(sectors_per_cluster)
}

/// Translates a virtual sector range `[vsn, vsn+n)` through a sorted sector
/// extent map into the physical ranges that cover it. The returned
/// extents' lengths sum to exactly `n`, or the call fails — it never
/// returns a short result.
pub fn vsn_to_lsn(map: &[SectorExtent], vsn: u64, n: u64) -> Result<Vec<SectorExtent>, NtfsError> {
    let mut remaining_index = vsn;
    let mut remaining_count = n;
    let mut result = Vec::new();

    for extent in map {
        if remaining_count == 0 {
            break;
        }
        if remaining_index >= extent.count {
            remaining_index -= extent.count;
            continue;
        }
        let available = extent.count - remaining_index;
        let take = available.min(remaining_count);
        let start = extent.start.map(|s| s + remaining_index);
        result.push(SectorExtent { start, count: take });
        remaining_count -= take;
        remaining_index = 0;
    }

    if remaining_count > 0 {
        return Err(NtfsError::RangeRequest {
            offset: vsn,
            length: n,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(start: Option<u64>, count: u64) -> SectorExtent {
        SectorExtent { start, count }
    }

    #[test]
    fn vsn_to_lsn_covers_exact_request() {
        let map = vec![extent(Some(100), 8), extent(Some(500), 8)];
        let result = vsn_to_lsn(&map, 4, 8).unwrap();
        let total: u64 = result.iter().map(|e| e.count).sum();
        assert_eq!(total, 8);
        assert_eq!(result[0], extent(Some(104), 4));
        assert_eq!(result[1], extent(Some(500), 4));
    }

    #[test]
    fn vsn_to_lsn_fails_past_map_end() {
        let map = vec![extent(Some(0), 8)];
        assert!(vsn_to_lsn(&map, 0, 100).is_err());
    }

    #[test]
    fn vsn_to_lsn_preserves_sparse_gaps() {
        let map = vec![extent(None, 8), extent(Some(0), 8)];
        let result = vsn_to_lsn(&map, 0, 16).unwrap();
        assert_eq!(result[0].start, None);
        assert_eq!(result[1].start, Some(0));
    }
}
