//! Local mount handling: invoking the OS mount primitive and checking the
//! live mount table.

pub mod executor;
pub mod table;

pub use executor::{AccountKey, CifsMounter, MountOptions, MountRequest, Mounter};
pub use table::{MountInspector, MountTable};
