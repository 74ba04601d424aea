//! Boot sector decode and validation.

use ntfsx_core::NtfsError;

use crate::block::DataBlock;
use crate::structures::{BootSectorRaw, BOOT_SIGNATURE, OEM_ID};

/// Decoded $Boot sector geometry, with `file_record_size`/`index_record_size`
/// already resolved from the signed cluster-count hints.
#[derive(Debug, Clone, Copy)]
pub struct BootSector {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    pub file_record_size: u32,
    pub index_record_size: u32,
    pub volume_serial: u64,
}

impl BootSector {
    pub fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    /// Parses and validates a 512+ byte boot sector block.
    pub fn parse(block: &DataBlock) -> Result<BootSector, NtfsError> {
        let raw: BootSectorRaw = block
            .read_struct(0)
            .ok_or_else(|| NtfsError::InvalidBootSector("boot sector block too short".into()))?;

        if raw.oem_id != *OEM_ID {
            return Err(NtfsError::InvalidBootSector(format!(
                "unexpected OEM id {:?}",
                raw.oem_id
            )));
        }
        if raw.signature != BOOT_SIGNATURE {
            let signature = raw.signature;
            return Err(NtfsError::InvalidBootSector(format!(
                "bad boot signature 0x{:04x}",
                signature
            )));
        }

        let bytes_per_sector = raw.bytes_per_sector as u32;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(NtfsError::InvalidBootSector(format!(
                "implausible bytes_per_sector {}",
                bytes_per_sector
            )));
        }

        let sectors_per_cluster = raw.sectors_per_cluster as u32;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(NtfsError::InvalidBootSector(format!(
                "sectors_per_cluster {} is not a power of two",
                sectors_per_cluster
            )));
        }

        let cluster_size = bytes_per_sector * sectors_per_cluster;
        let file_record_size = size_from_hint(raw.clusters_per_file_record, cluster_size);
        let index_record_size = size_from_hint(raw.clusters_per_index_record, cluster_size);

        Ok(BootSector {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors: raw.total_sectors,
            mft_lcn: raw.mft_lcn,
            mftmirr_lcn: raw.mftmirr_lcn,
            file_record_size,
            index_record_size,
            volume_serial: raw.volume_serial,
        })
    }
}

/// A positive hint is a cluster count; a negative hint `-n` means `2^n`
/// bytes, independent of cluster size. Per §4.3.
fn size_from_hint(hint: i8, cluster_size: u32) -> u32 {
    if hint > 0 {
        hint as u32 * cluster_size
    } else {
        1u32 << (-(hint as i32)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_boot_sector() -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[3..11].copy_from_slice(OEM_ID);
        buf[11..13].copy_from_slice(&512u16.to_le_bytes());
        buf[13] = 8; // sectors_per_cluster
        buf[0x30..0x38].copy_from_slice(&786432u64.to_le_bytes()); // mft_lcn
        buf[0x38..0x40].copy_from_slice(&2u64.to_le_bytes()); // mftmirr_lcn
        buf[0x40] = 0xF6u8; // clusters_per_file_record = -10 -> 1024
        buf[0x44] = 0x01; // clusters_per_index_record = 1 cluster
        buf[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        buf
    }

    #[test]
    fn parses_valid_boot_sector() {
        let block = DataBlock::from_owned(raw_boot_sector());
        let boot = BootSector::parse(&block).unwrap();
        assert_eq!(boot.bytes_per_sector, 512);
        assert_eq!(boot.sectors_per_cluster, 8);
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.file_record_size, 1024);
        assert_eq!(boot.index_record_size, 4096);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = raw_boot_sector();
        bytes[510] = 0;
        bytes[511] = 0;
        let block = DataBlock::from_owned(bytes);
        assert!(BootSector::parse(&block).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_cluster_count() {
        let mut bytes = raw_boot_sector();
        bytes[13] = 3;
        let block = DataBlock::from_owned(bytes);
        assert!(BootSector::parse(&block).is_err());
    }
}
