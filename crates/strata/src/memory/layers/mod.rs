//! Backing stores and the physical address space over them.

pub mod buffer;
pub mod container;
pub mod mmap_file;
pub mod physical;
pub mod segmented;

pub use buffer::BufferStore;
pub use container::ContainerStore;
pub use mmap_file::MmapFileStore;
pub use physical::PhysicalSpace;
pub use segmented::SegmentedStore;
