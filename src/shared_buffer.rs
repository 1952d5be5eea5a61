#![allow(unsafe_code)]
//! Memory-mapped shared buffer for cross-process strip transfer.
//!
//! The coordinator creates one file-backed mapping sized for every strip of a batch.
//! Worker processes open the same file, find their slot in the header, and copy their
//! filtered pixels straight into that slot's region. The coordinator reads the regions
//! back only after every writer has been joined.
//!
//! # Memory Layout
//! ```text
//! [64-byte header] [slot table: 32 bytes per slot] [pad to 64] [data region]
//!
//! Header:
//!   magic:       u64   (0x53545250_53484D01)
//!   version:     u32
//!   slot_count:  u32
//!   channels:    u32
//!   layout:      u32   (0 = packed, 1 = uniform)
//!   data_offset: u64   (absolute file offset of the data region)
//!   data_len:    u64
//!   padding:     [u8; 24]
//!
//! Slot entry:
//!   offset:      u64   (relative to the data region)
//!   origin_x:    u32   (column of the strip in the source image)
//!   width:       u32
//!   height:      u32
//!   written:     u32   (set to 1 by the writer after its copy)
//!   reserved:    u64
//! ```
//!
//! Every slot records its own offset and dimensions, so a partition whose last strip is
//! wider than the others still maps to exact, disjoint regions. The `uniform` layout
//! keeps the fixed-stride arithmetic (`offset = index * stride`) and is only
//! constructible for strips that all share one shape.
//!
//! # Synchronization
//!
//! There are no locks. Writers touch disjoint byte ranges through bounds-checked
//! slices. [`SharedBuffer`] can be written but not read; [`SealedBuffer`] can be read
//! but not written, and the only way to get one is [`SharedBuffer::seal`], which joins
//! every writer process first.

use crate::error::{StripError, StripResult};
use crate::partition::uniform_shape;
use crate::raster::{Image, Shape, Strip, CHANNELS};
use crate::transport::{join_all, WorkerHandle};
use bytes::{Buf, BufMut};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Magic number for header validation
const MAGIC: u64 = 0x5354_5250_5348_4D01;

/// Header format version
const VERSION: u32 = 1;

/// Size of the fixed header in bytes
const HEADER_SIZE: usize = 64;

/// Size of one slot table entry in bytes
const SLOT_ENTRY_SIZE: usize = 32;

/// Data region alignment
const DATA_ALIGN: usize = 64;

/// Byte offset of the `written` flag inside a slot entry
const WRITTEN_FIELD: usize = 20;

/// How slot offsets are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LayoutKind {
    /// Back-to-back regions with per-slot offsets and dimensions.
    Packed,
    /// Fixed stride; every slot has the same shape.
    Uniform,
}

impl LayoutKind {
    fn code(self) -> u32 {
        match self {
            LayoutKind::Packed => 0,
            LayoutKind::Uniform => 1,
        }
    }

    fn from_code(code: u32) -> StripResult<Self> {
        match code {
            0 => Ok(LayoutKind::Packed),
            1 => Ok(LayoutKind::Uniform),
            other => Err(StripError::Protocol(format!(
                "unknown shared buffer layout code {other}"
            ))),
        }
    }
}

/// One region of the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset from the start of the data region.
    pub offset: usize,
    /// Column of the strip in the source image.
    pub origin_x: u32,
    /// Dimensions of the pixels stored here.
    pub shape: Shape,
}

impl Slot {
    /// Byte range of this slot within the data region.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.shape.byte_len()
    }
}

/// Placement of every strip inside the data region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLayout {
    kind: LayoutKind,
    slots: Vec<Slot>,
}

impl SharedLayout {
    /// Regions laid out back to back in index order, each with its own dimensions.
    pub fn packed<I>(slots: I) -> Self
    where
        I: IntoIterator<Item = (u32, Shape)>,
    {
        let mut offset = 0;
        let slots = slots
            .into_iter()
            .map(|(origin_x, shape)| {
                let slot = Slot {
                    offset,
                    origin_x,
                    shape,
                };
                offset += shape.byte_len();
                slot
            })
            .collect();
        Self {
            kind: LayoutKind::Packed,
            slots,
        }
    }

    /// `count` regions of identical `shape`; slot `i` starts at `i * shape.byte_len()`.
    pub fn uniform(count: usize, shape: Shape) -> Self {
        let stride = shape.byte_len();
        let slots = (0..count)
            .map(|i| Slot {
                offset: i * stride,
                origin_x: (i as u32).saturating_mul(shape.width),
                shape,
            })
            .collect();
        Self {
            kind: LayoutKind::Uniform,
            slots,
        }
    }

    /// Layout for a batch of strips.
    ///
    /// The uniform layout fails with [`StripError::ShapeMismatch`] unless every strip
    /// has the same shape.
    pub fn for_strips(strips: &[Strip], kind: LayoutKind) -> StripResult<Self> {
        match kind {
            LayoutKind::Packed => Ok(Self::packed(
                strips.iter().map(|strip| (strip.offset_x, strip.shape())),
            )),
            LayoutKind::Uniform => {
                let shape = uniform_shape(strips).ok_or_else(|| {
                    StripError::ShapeMismatch(format!(
                        "uniform shared layout needs identical strips, got widths {:?}",
                        strips.iter().map(Strip::width).collect::<Vec<_>>()
                    ))
                })?;
                let mut layout = Self::uniform(strips.len(), shape);
                for (slot, strip) in layout.slots.iter_mut().zip(strips) {
                    slot.origin_x = strip.offset_x;
                }
                Ok(layout)
            }
        }
    }

    /// Layout kind.
    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    /// All slots in index order.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the layout has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot `index`, or a shape error when out of range.
    pub fn slot(&self, index: usize) -> StripResult<&Slot> {
        self.slots.get(index).ok_or_else(|| {
            StripError::ShapeMismatch(format!(
                "slot {} out of range for layout with {} slots",
                index,
                self.slots.len()
            ))
        })
    }

    /// Size of the data region.
    pub fn data_len(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.range().end)
            .max()
            .unwrap_or(0)
    }

    fn table_len(&self) -> usize {
        self.slots.len() * SLOT_ENTRY_SIZE
    }

    fn data_offset(&self) -> usize {
        (HEADER_SIZE + self.table_len()).div_ceil(DATA_ALIGN) * DATA_ALIGN
    }

    /// Total file size for this layout.
    pub fn file_len(&self) -> usize {
        self.data_offset() + self.data_len()
    }

    fn encode_into(&self, bytes: &mut [u8]) {
        let data_offset = self.data_offset();
        let mut header = &mut bytes[..HEADER_SIZE];
        header.put_u64_le(MAGIC);
        header.put_u32_le(VERSION);
        header.put_u32_le(self.slots.len() as u32);
        header.put_u32_le(CHANNELS);
        header.put_u32_le(self.kind.code());
        header.put_u64_le(data_offset as u64);
        header.put_u64_le(self.data_len() as u64);
        let padding = header.remaining_mut();
        header.put_bytes(0, padding);

        for (i, slot) in self.slots.iter().enumerate() {
            let start = HEADER_SIZE + i * SLOT_ENTRY_SIZE;
            let mut entry = &mut bytes[start..start + SLOT_ENTRY_SIZE];
            entry.put_u64_le(slot.offset as u64);
            entry.put_u32_le(slot.origin_x);
            entry.put_u32_le(slot.shape.width);
            entry.put_u32_le(slot.shape.height);
            entry.put_u32_le(0);
            entry.put_u64_le(0);
        }
    }

    fn decode(bytes: &[u8]) -> StripResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(StripError::Protocol(format!(
                "shared buffer of {} bytes is smaller than its header",
                bytes.len()
            )));
        }
        let mut header = &bytes[..HEADER_SIZE];
        let magic = header.get_u64_le();
        if magic != MAGIC {
            return Err(StripError::Protocol(format!(
                "Invalid shared buffer magic number: expected 0x{:016X}, got 0x{:016X}",
                MAGIC, magic
            )));
        }
        let version = header.get_u32_le();
        if version != VERSION {
            return Err(StripError::Protocol(format!(
                "unsupported shared buffer version {version}"
            )));
        }
        let slot_count = header.get_u32_le() as usize;
        let channels = header.get_u32_le();
        let kind = LayoutKind::from_code(header.get_u32_le())?;
        let data_offset = header.get_u64_le() as usize;
        let data_len = header.get_u64_le() as usize;

        let table_end = HEADER_SIZE + slot_count * SLOT_ENTRY_SIZE;
        if bytes.len() < table_end {
            return Err(StripError::Protocol(format!(
                "shared buffer truncated: slot table needs {} bytes, file has {}",
                table_end,
                bytes.len()
            )));
        }

        let slots = (0..slot_count)
            .map(|i| {
                let start = HEADER_SIZE + i * SLOT_ENTRY_SIZE;
                let mut entry = &bytes[start..start + SLOT_ENTRY_SIZE];
                let offset = entry.get_u64_le() as usize;
                let origin_x = entry.get_u32_le();
                let width = entry.get_u32_le();
                let height = entry.get_u32_le();
                Slot {
                    offset,
                    origin_x,
                    shape: Shape {
                        width,
                        height,
                        channels,
                    },
                }
            })
            .collect();
        let layout = Self { kind, slots };

        if layout.data_offset() != data_offset
            || layout.data_len() != data_len
            || bytes.len() < layout.file_len()
        {
            return Err(StripError::Protocol(
                "shared buffer header disagrees with its slot table".to_string(),
            ));
        }
        Ok(layout)
    }
}

/// Default directory for backing files: `/dev/shm` when present, else the temp dir.
pub fn default_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

fn written_flag_at(index: usize) -> usize {
    HEADER_SIZE + index * SLOT_ENTRY_SIZE + WRITTEN_FIELD
}

/// Copy `image` into `slot` of a mapped file and mark the slot written.
fn store_into(
    bytes: &mut [u8],
    layout: &SharedLayout,
    index: usize,
    image: &Image,
) -> StripResult<()> {
    let slot = layout.slot(index)?;
    if image.shape() != slot.shape {
        return Err(StripError::ShapeMismatch(format!(
            "slot {} holds {}, cannot store {}",
            index,
            slot.shape,
            image.shape()
        )));
    }
    let base = layout.data_offset();
    let range = slot.range();
    let region = bytes
        .get_mut(base + range.start..base + range.end)
        .ok_or_else(|| StripError::Protocol(format!("slot {index} lies outside the mapping")))?;
    region.copy_from_slice(image.as_bytes());

    let flag = written_flag_at(index);
    let mut field = &mut bytes[flag..flag + 4];
    field.put_u32_le(1);
    Ok(())
}

/// Coordinator-owned shared buffer in its writing phase.
pub struct SharedBuffer {
    /// Backing file, removed when the buffer is dropped
    file: tempfile::NamedTempFile,
    /// Mapping of the whole file
    mmap: MmapMut,
    layout: SharedLayout,
}

impl SharedBuffer {
    /// Create a backing file in `dir` (or [`default_dir`]) sized for `layout`.
    pub fn create(dir: Option<&Path>, layout: SharedLayout) -> StripResult<Self> {
        let dir = dir.map_or_else(default_dir, Path::to_path_buf);
        let file = tempfile::Builder::new()
            .prefix("strip-blur-")
            .suffix(".shm")
            .tempfile_in(&dir)?;
        let total = layout.file_len();
        file.as_file().set_len(total as u64)?;

        // SAFETY: the file was just created with the right length and is only
        // mapped by this process and the workers it hands the path to.
        let mut mmap = unsafe { MmapOptions::new().map_mut(file.as_file())? };
        layout.encode_into(&mut mmap);
        mmap.flush()?;

        info!(
            path = %file.path().display(),
            slots = layout.len(),
            data_bytes = layout.data_len(),
            kind = ?layout.kind(),
            "Shared buffer created"
        );
        Ok(Self { file, mmap, layout })
    }

    /// Path workers open to reach their slot.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Slot placement.
    pub fn layout(&self) -> &SharedLayout {
        &self.layout
    }

    /// Write `strip` into slot `index` from the coordinator side.
    pub fn store(&mut self, index: usize, strip: &Strip) -> StripResult<()> {
        store_into(&mut self.mmap, &self.layout, index, &strip.image)
    }

    /// Join every writer, then hand out the read-only view.
    ///
    /// Any writer failure (or cancellation) terminates the remaining writers and
    /// the buffer is discarded.
    pub async fn seal(
        self,
        writers: Vec<WorkerHandle>,
        cancel: &CancellationToken,
    ) -> StripResult<SealedBuffer> {
        let count = writers.len();
        join_all(writers, cancel).await?;
        debug!(writers = count, "Shared buffer sealed");
        Ok(SealedBuffer {
            _file: self.file,
            mmap: self.mmap,
            layout: self.layout,
        })
    }
}

/// Read-only view of a shared buffer whose writers have all been joined.
pub struct SealedBuffer {
    _file: tempfile::NamedTempFile,
    mmap: MmapMut,
    layout: SharedLayout,
}

impl SealedBuffer {
    /// Slot placement.
    pub fn layout(&self) -> &SharedLayout {
        &self.layout
    }

    /// Whether slot `index` has been written.
    pub fn is_written(&self, index: usize) -> bool {
        let flag = written_flag_at(index);
        self.mmap
            .get(flag..flag + 4)
            .map(|mut field| field.get_u32_le() == 1)
            .unwrap_or(false)
    }

    /// Read slot `index` back as a strip of the given dimensions.
    pub fn load(&self, index: usize, width: u32, height: u32) -> StripResult<Strip> {
        let slot = self.layout.slot(index)?;
        let requested = Shape::rgb(width, height);
        if requested != slot.shape {
            return Err(StripError::ShapeMismatch(format!(
                "slot {} holds {}, requested {}",
                index, slot.shape, requested
            )));
        }
        if !self.is_written(index) {
            return Err(StripError::transport(
                index,
                "shared buffer slot was never written",
            ));
        }
        let base = self.layout.data_offset();
        let range = slot.range();
        let bytes = self
            .mmap
            .get(base + range.start..base + range.end)
            .ok_or_else(|| StripError::Protocol(format!("slot {index} lies outside the mapping")))?;
        let image = Image::with_shape(slot.shape, bytes.to_vec())?;
        Ok(Strip::new(index, slot.origin_x, image))
    }

    /// Read every slot in index order.
    pub fn load_all(&self) -> StripResult<Vec<Strip>> {
        self.layout
            .slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| self.load(index, slot.shape.width, slot.shape.height))
            .collect()
    }
}

/// Worker-side handle on one slot of an existing shared buffer.
pub struct SlotWriter {
    mmap: MmapMut,
    layout: SharedLayout,
    index: usize,
}

impl SlotWriter {
    /// Map the buffer at `path` and claim slot `index`.
    pub fn open(path: &Path, index: usize) -> StripResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the file was created and sized by the coordinator, which keeps it
        // alive until this process has been joined.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let layout = SharedLayout::decode(&mmap)?;
        layout.slot(index)?;
        Ok(Self {
            mmap,
            layout,
            index,
        })
    }

    /// Shape this slot expects.
    pub fn shape(&self) -> StripResult<Shape> {
        Ok(self.layout.slot(self.index)?.shape)
    }

    /// Copy `image` into the slot and flush it to the backing file.
    pub fn store(&mut self, image: &Image) -> StripResult<()> {
        store_into(&mut self.mmap, &self.layout, self.index, image)?;
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::split;
    use crate::raster::tests::gradient;

    fn strips_of(width: u32, n: usize) -> Vec<Strip> {
        split(&gradient(width, 6), n).unwrap()
    }

    #[test]
    fn packed_layout_handles_remainder_strip() {
        let strips = strips_of(10, 3);
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let offsets: Vec<usize> = layout.slots().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 3 * 6 * 3, 2 * 3 * 6 * 3]);
        assert_eq!(layout.data_len(), 10 * 6 * 3);
        assert_eq!(layout.slots()[2].shape.width, 4);
    }

    #[test]
    fn uniform_layout_uses_fixed_stride() {
        let layout = SharedLayout::uniform(4, Shape::rgb(5, 2));
        let offsets: Vec<usize> = layout.slots().iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 30, 60, 90]);
        assert_eq!(layout.data_len(), 120);
    }

    #[test]
    fn uniform_layout_rejects_uneven_strips() {
        let strips = strips_of(10, 3);
        assert!(matches!(
            SharedLayout::for_strips(&strips, LayoutKind::Uniform),
            Err(StripError::ShapeMismatch(_))
        ));
        let even = strips_of(9, 3);
        let layout = SharedLayout::for_strips(&even, LayoutKind::Uniform).unwrap();
        assert_eq!(layout.kind(), LayoutKind::Uniform);
        assert_eq!(layout.slots()[1].origin_x, 3);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let layout = SharedLayout::for_strips(&strips_of(11, 4), LayoutKind::Packed).unwrap();
        let mut bytes = vec![0u8; layout.file_len()];
        layout.encode_into(&mut bytes);
        assert_eq!(SharedLayout::decode(&bytes).unwrap(), layout);

        bytes[0] ^= 0xFF;
        assert!(matches!(
            SharedLayout::decode(&bytes),
            Err(StripError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn store_seal_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let strips = strips_of(10, 3);
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let mut buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();
        for (slot, strip) in strips.iter().enumerate() {
            buffer.store(slot, strip).unwrap();
        }
        let sealed = buffer
            .seal(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sealed.load_all().unwrap(), strips);
    }

    #[tokio::test]
    async fn slot_writer_lands_in_coordinator_view() {
        let dir = tempfile::tempdir().unwrap();
        let strips = strips_of(8, 2);
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();

        for (slot, strip) in strips.iter().enumerate() {
            let mut writer = SlotWriter::open(buffer.path(), slot).unwrap();
            assert_eq!(writer.shape().unwrap(), strip.shape());
            writer.store(&strip.image).unwrap();
        }

        let sealed = buffer
            .seal(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sealed.load(1, 4, 6).unwrap(), strips[1]);
    }

    #[tokio::test]
    async fn mismatched_shapes_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let strips = strips_of(10, 3);
        let layout = SharedLayout::for_strips(&strips, LayoutKind::Packed).unwrap();
        let mut buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();

        assert!(matches!(
            buffer.store(0, &strips[2]),
            Err(StripError::ShapeMismatch(_))
        ));
        assert!(matches!(
            buffer.store(7, &strips[0]),
            Err(StripError::ShapeMismatch(_))
        ));
        buffer.store(0, &strips[0]).unwrap();

        let sealed = buffer
            .seal(Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            sealed.load(0, 4, 6),
            Err(StripError::ShapeMismatch(_))
        ));
        assert!(matches!(
            sealed.load(1, 3, 6),
            Err(StripError::WorkerTransport { index: 1, .. })
        ));
    }

    #[test]
    fn backing_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SharedLayout::uniform(2, Shape::rgb(2, 2));
        let buffer = SharedBuffer::create(Some(dir.path()), layout).unwrap();
        let path = buffer.path().to_path_buf();
        assert!(path.exists());
        drop(buffer);
        assert!(!path.exists());
    }
}
