//! A read-only NTFS forensic inspection engine: boot sector, MFT records,
//! attributes, data runs, directory indexes, and the USN change journal.

pub mod attribute;
pub mod block;
pub mod boot_sector;
pub mod data_runs;
pub mod file_record;
pub mod fixup;
pub mod index;
pub mod structures;
pub mod usn;
pub mod volume;

pub use attribute::{Attribute, AttributePayload, Bitmap};
pub use block::DataBlock;
pub use boot_sector::BootSector;
pub use data_runs::{DataRun, SectorExtent};
pub use file_record::FileRecord;
pub use index::{IndexEntry, IndexNode, IndexRecord};
pub use usn::{UsnJournal, UsnMax, UsnRecord};
pub use volume::Volume;
