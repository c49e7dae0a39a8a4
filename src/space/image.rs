//! Image space: a read-only, pre-baked heap mapped at startup.
//!
//! The collectors treat it as immutable: never swept, bitmaps never updated
//! after load. References from image objects into mutable spaces are tracked
//! by a mod-union table the heap installs over this space.

use std::path::Path;
use std::sync::Arc;

use crate::accounting::SpaceBitmap;
use crate::error::{HeapError, HeapResult};
use crate::mem_map::MemMap;
use crate::object::{Address, ObjectModel, ObjectRef};

use super::bump_pointer::align_object;
use super::{BitmapPair, ContinuousSpace, GcRetentionPolicy, Space};

pub const IMAGE_MAGIC: [u8; 4] = *b"CIMG";
pub const IMAGE_VERSION: u32 = 1;
/// Objects start at this offset so they stay page- and object-aligned.
pub const IMAGE_OBJECTS_OFFSET: usize = 4096;

/// On-disk header at offset 0 of an image file.
#[derive(Debug, Clone, Copy)]
pub struct ImageHeader {
    pub version: u32,
    /// Offset of the end of the packed object section.
    pub objects_end: u64,
}

impl ImageHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&IMAGE_MAGIC);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.objects_end.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<ImageHeader> {
        if bytes.len() < Self::SIZE || bytes[0..4] != IMAGE_MAGIC {
            return None;
        }
        Some(ImageHeader {
            version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            objects_end: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
        })
    }
}

pub struct ImageSpace {
    name: String,
    mem: MemMap,
    objects_end: Address,
    bitmaps: BitmapPair,
}

impl ImageSpace {
    /// Map `path` read-only, validate its header, and pre-populate the live
    /// bitmap by walking the packed object section with the size callback.
    pub fn load(
        name: &str,
        path: &Path,
        model: &dyn ObjectModel,
    ) -> HeapResult<Arc<ImageSpace>> {
        let invalid = |reason: &str| HeapError::ImageInvalid {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };

        let mem = MemMap::map_file(name, path)?;
        if mem.size() < IMAGE_OBJECTS_OFFSET {
            return Err(invalid("file smaller than the object section offset"));
        }
        // SAFETY: the mapping is at least IMAGE_OBJECTS_OFFSET bytes.
        let header_bytes =
            unsafe { std::slice::from_raw_parts(mem.begin().as_ptr::<u8>(), ImageHeader::SIZE) };
        let header = ImageHeader::decode(header_bytes).ok_or_else(|| invalid("bad magic"))?;
        if header.version != IMAGE_VERSION {
            return Err(invalid("unsupported version"));
        }
        let objects_end_offset = header.objects_end as usize;
        if objects_end_offset < IMAGE_OBJECTS_OFFSET || objects_end_offset > mem.size() {
            return Err(invalid("object section out of bounds"));
        }

        let begin = mem.begin();
        let objects_end = begin + objects_end_offset;
        let bitmaps = BitmapPair::new(name, begin, mem.size());
        let live = bitmaps.live();
        let mut addr = begin + IMAGE_OBJECTS_OFFSET;
        while addr < objects_end {
            // SAFETY: the object section is densely packed by the writer.
            let obj = unsafe { ObjectRef::from_address_unchecked(addr) };
            live.set(obj);
            let size = model.size_of(obj);
            if size == 0 {
                return Err(invalid("zero-sized object in image"));
            }
            addr = addr + align_object(size);
        }

        tracing::info!(
            image = %path.display(),
            begin = %begin,
            objects = live.count(),
            "loaded image space"
        );
        Ok(Arc::new(ImageSpace {
            name: name.to_string(),
            objects_end,
            bitmaps,
            mem,
        }))
    }

    pub fn objects_begin(&self) -> Address {
        self.mem.begin() + IMAGE_OBJECTS_OFFSET
    }
}

impl Space for ImageSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::NeverCollect
    }
}

impl ContinuousSpace for ImageSpace {
    fn begin(&self) -> Address {
        self.mem.begin()
    }

    fn end(&self) -> Address {
        self.objects_end
    }

    fn limit(&self) -> Address {
        self.mem.end()
    }

    fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.live()
    }

    fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.mark()
    }

    fn swap_bitmaps(&self) {
        // The image is never swept; its bitmaps never swap.
    }
}
