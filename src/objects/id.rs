use std::fmt::{Debug, Formatter};

pub struct ObjectType;

impl ObjectType {
    pub const fn as_str(ty: u8) -> &'static str {
        match ty {
            Self::GENERIC => "Generic",
            Self::BUFFER => "Buffer",
            Self::IMAGE => "Image",
            Self::SEMAPHORE => "Semaphore",
            Self::EVENT => "Event",
            Self::FRAMEBUFFER => "Framebuffer",
            Self::PIPELINE => "Pipeline",
            Self::DESCRIPTOR_SET => "DescriptorSet",
            Self::QUERY_POOL => "QueryPool",
            _ => "Invalid",
        }
    }

    pub const GENERIC: u8 = 0u8;
    pub const BUFFER: u8 = 1u8;
    pub const IMAGE: u8 = 2u8;
    pub const SEMAPHORE: u8 = 3u8;
    pub const EVENT: u8 = 4u8;
    pub const FRAMEBUFFER: u8 = 5u8;
    pub const PIPELINE: u8 = 6u8;
    pub const DESCRIPTOR_SET: u8 = 7u8;
    pub const QUERY_POOL: u8 = 8u8;
}

/// Identifies a resource inside the arena of a [`crate::objects::ResourceManager`].
///
/// The id packs the arena slot index, the generation of the slot and the object type into a
/// single u64. Slot reuse bumps the generation so stale ids never compare equal to new ones.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    const INDEX_BITS: u32 = 32u32;
    const INDEX_OFFSET: u32 = 0u32;
    pub const INDEX_MAX: u64 = (1u64 << Self::INDEX_BITS) - 1u64;
    const INDEX_MASK: u64 = Self::INDEX_MAX << Self::INDEX_OFFSET;

    const GENERATION_BITS: u32 = 24u32;
    const GENERATION_OFFSET: u32 = Self::INDEX_OFFSET + Self::INDEX_BITS;
    pub const GENERATION_MAX: u64 = (1u64 << Self::GENERATION_BITS) - 1u64;
    const GENERATION_MASK: u64 = Self::GENERATION_MAX << Self::GENERATION_OFFSET;

    const TYPE_OFFSET: u32 = Self::GENERATION_OFFSET + Self::GENERATION_BITS;
    const TYPE_MASK: u64 = (u8::MAX as u64) << Self::TYPE_OFFSET;

    pub(crate) fn make(index: u32, generation: u32, object_type: u8) -> Self {
        let generation = (generation as u64) & Self::GENERATION_MAX;

        Self(((index as u64) << Self::INDEX_OFFSET)
            | (generation << Self::GENERATION_OFFSET)
            | ((object_type as u64) << Self::TYPE_OFFSET))
    }

    pub const fn get_index(&self) -> u32 {
        ((self.0 & Self::INDEX_MASK) >> Self::INDEX_OFFSET) as u32
    }

    pub const fn get_generation(&self) -> u32 {
        ((self.0 & Self::GENERATION_MASK) >> Self::GENERATION_OFFSET) as u32
    }

    pub const fn get_type(&self) -> u8 {
        ((self.0 & Self::TYPE_MASK) >> Self::TYPE_OFFSET) as u8
    }

    pub const fn get_raw(&self) -> u64 {
        self.0
    }
}

impl Debug for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("ResourceId({}#{}:{})", ObjectType::as_str(self.get_type()), self.get_index(), self.get_generation()))
    }
}
