pub mod device;
pub mod error;
pub mod time;

pub use device::{BlockDevice, FileBlockDevice, SectorRange};
pub use error::NtfsError;
pub use time::filetime_to_utc;
