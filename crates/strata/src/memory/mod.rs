pub mod error;
pub mod image;
pub mod layers;
pub mod scanners;
pub mod traits;
pub mod translators;

pub use error::{MemoryError, MemoryResult};
pub use image::{open_image, ImageFormat, MemoryImage};
pub use traits::{AddressSpace, BackingStore, FillPolicy, MappedRange, PartialRead, Translation};
