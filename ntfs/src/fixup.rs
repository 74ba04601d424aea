//! Update Sequence Array (USA) fixup, shared by FILE and INDX records.

use ntfsx_core::NtfsError;

const SECTOR_SIZE: usize = 512;

/// Verifies and undoes USA fixup in place. `usa_offset`/`usa_count` are the
/// record header's own fields; the first USA word is the sentinel USN, the
/// remaining `usa_count - 1` words are the original per-sector tail bytes.
///
/// The last two bytes of each 512-byte sector must equal the sentinel
/// before being overwritten; a mismatch means the record was read from a
/// torn or corrupt write and is rejected rather than silently patched.
pub fn apply_fixup(buffer: &mut [u8], usa_offset: u16, usa_count: u16) -> Result<(), NtfsError> {
    let usa_offset = usa_offset as usize;
    let usa_count = usa_count as usize;

    if usa_count == 0 {
        return Ok(());
    }
    if usa_offset + usa_count * 2 > buffer.len() {
        return Err(NtfsError::CorruptStructure(
            "update sequence array extends beyond buffer".into(),
        ));
    }

    let usn = [buffer[usa_offset], buffer[usa_offset + 1]];

    for i in 1..usa_count {
        let usa_value_offset = usa_offset + i * 2;
        let usa_value = [buffer[usa_value_offset], buffer[usa_value_offset + 1]];

        let sector_tail = i * SECTOR_SIZE - 2;
        if sector_tail + 2 > buffer.len() {
            return Err(NtfsError::CorruptStructure(
                "update sequence array covers more sectors than buffer holds".into(),
            ));
        }

        if buffer[sector_tail] != usn[0] || buffer[sector_tail + 1] != usn[1] {
            return Err(NtfsError::CorruptStructure(format!(
                "fixup mismatch at sector {}: expected {:02x}{:02x}, found {:02x}{:02x}",
                i, usn[0], usn[1], buffer[sector_tail], buffer[sector_tail + 1]
            )));
        }

        buffer[sector_tail] = usa_value[0];
        buffer[sector_tail + 1] = usa_value[1];
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_original_sector_tails() {
        let mut data = vec![0u8; 1024];
        data[0x30] = 0x01;
        data[0x31] = 0x00;
        data[0x32] = 0xAA;
        data[0x33] = 0xBB;
        data[0x34] = 0xCC;
        data[0x35] = 0xDD;
        data[510] = 0x01;
        data[511] = 0x00;
        data[1022] = 0x01;
        data[1023] = 0x00;

        apply_fixup(&mut data, 0x30, 3).unwrap();

        assert_eq!(&data[510..512], &[0xAA, 0xBB]);
        assert_eq!(&data[1022..1024], &[0xCC, 0xDD]);
    }

    #[test]
    fn rejects_sentinel_mismatch() {
        let mut data = vec![0u8; 1024];
        data[0x30] = 0x01;
        data[0x31] = 0x00;
        data[0x32] = 0xAA;
        data[0x33] = 0xBB;
        data[510] = 0x02; // wrong sentinel
        data[511] = 0x00;

        assert!(apply_fixup(&mut data, 0x30, 2).is_err());
    }
}
