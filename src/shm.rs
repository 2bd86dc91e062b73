//! Shared-memory transport between the capture producer and this consumer.
//!
//! A single named region holds one [`Header`] followed by one RGBA frame
//! buffer. The producer and consumer never lock: the `frame_ready` and
//! `result_ready` words, updated with single release stores and observed
//! with acquire loads, are the entire synchronization protocol. Everything
//! else in the region is owned by exactly one side between flag
//! transitions.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use thiserror::Error;

use crate::types::{ActionCommand, GameState, VisionResult};

/// Name of the shared object, as the producer creates it.
pub const SHM_NAME: &str = "/rashplayer_shm";

/// "RASH" in little-endian bytes. Anything else means "not attached".
pub const SHM_MAGIC: u32 = 0x5241_5348;

pub const SHM_VERSION: u32 = 1;

pub const MAX_FRAME_WIDTH: i32 = 1920;
pub const MAX_FRAME_HEIGHT: i32 = 1080;

/// Result slots in the header; at most this many triggers report per frame.
pub const MAX_RESULTS: usize = 16;

/// Pixel buffer large enough for the biggest supported frame (RGBA).
pub const FRAME_BUFFER_SIZE: usize =
    (MAX_FRAME_WIDTH * MAX_FRAME_HEIGHT * 4) as usize;

/// Slack after the pixel buffer; both sides agree on total size a priori.
const TAIL_PADDING: usize = 4096;

/// Total size of the shared region.
pub const fn region_size() -> usize {
    mem::size_of::<Header>() + FRAME_BUFFER_SIZE + TAIL_PADDING
}

/// The shared header. Field order and widths are the wire contract
/// (little-endian, 64-byte aligned); the pixel buffer begins immediately
/// after it.
///
/// Ownership: the producer writes `frame_number`, `frame_timestamp_ns` and
/// the frame metadata, and raises `frame_ready`. The consumer writes the
/// results, latencies, pending action and `current_state`, raises
/// `result_ready`, and clears `frame_ready`. The producer clears
/// `result_ready`.
#[repr(C, align(64))]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub frame_number: u64,
    pub frame_timestamp_ns: i64,

    frame_ready: AtomicU32,
    result_ready: AtomicU32,
    current_state: AtomicU32,
    _pad0: u32,

    pub frame_width: i32,
    pub frame_height: i32,
    pub frame_stride: i32,
    _pad1: i32,

    pub vision_latency_ns: i64,
    pub brain_latency_ns: i64,
    pub total_latency_ns: i64,
    _pad2: i64,

    pub num_results: u32,
    _pad3: u32,
    pub results: [VisionResult; MAX_RESULTS],

    pub pending_action: ActionCommand,
}

impl Default for Header {
    /// A quiescent header carrying the identity words: valid magic and
    /// version, both flags down, no results, state IDLE.
    fn default() -> Self {
        Self {
            magic: SHM_MAGIC,
            version: SHM_VERSION,
            frame_number: 0,
            frame_timestamp_ns: 0,
            frame_ready: AtomicU32::new(0),
            result_ready: AtomicU32::new(0),
            current_state: AtomicU32::new(GameState::Idle as u32),
            _pad0: 0,
            frame_width: 0,
            frame_height: 0,
            frame_stride: 0,
            _pad1: 0,
            vision_latency_ns: 0,
            brain_latency_ns: 0,
            total_latency_ns: 0,
            _pad2: 0,
            num_results: 0,
            _pad3: 0,
            results: [VisionResult::default(); MAX_RESULTS],
            pending_action: ActionCommand::none(),
        }
    }
}

impl Header {
    /// Producer-raised flag: a frame is waiting for the consumer.
    pub fn frame_ready(&self) -> bool {
        self.frame_ready.load(Ordering::Acquire) != 0
    }

    /// Producer side: publish the frame written before this call.
    pub fn publish_frame(&self) {
        self.frame_ready.store(1, Ordering::Release);
    }

    /// Consumer side: arm the next cycle after results are out.
    pub fn clear_frame_ready(&self) {
        self.frame_ready.store(0, Ordering::Release);
    }

    /// Consumer-raised flag: results for the current frame are ready.
    pub fn result_ready(&self) -> bool {
        self.result_ready.load(Ordering::Acquire) != 0
    }

    /// Consumer side: publish the results written before this call.
    pub fn publish_result(&self) {
        self.result_ready.store(1, Ordering::Release);
    }

    /// Producer side: acknowledge the results were read.
    pub fn clear_result_ready(&self) {
        self.result_ready.store(0, Ordering::Release);
    }

    /// Consumer-owned lifecycle state, readable by the producer.
    pub fn state(&self) -> GameState {
        GameState::from_raw(self.current_state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: GameState) {
        self.current_state.store(state as u32, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory region {0} not found")]
    NotFound(String),

    #[error("shared memory io: {0}")]
    Io(#[from] std::io::Error),

    #[error("region is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("bad magic {found:#010x}, region not initialized by a producer")]
    BadMagic { found: u32 },

    #[error("unsupported shared memory version {found}")]
    BadVersion { found: u32 },

    #[error("frame of {got} bytes declared, buffer holds {capacity}")]
    FrameOutOfBounds { got: usize, capacity: usize },
}

/// A mapped shared region; the mapping is released on drop.
#[derive(Debug)]
pub struct SharedRegion {
    map: MmapMut,
}

fn shm_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(name.trim_start_matches('/'))
}

impl SharedRegion {
    /// Create (or reset) the named region under `/dev/shm` and stamp the
    /// identity words. This is the producer's entry point; the consumer
    /// uses [`SharedRegion::attach`].
    pub fn create(name: &str) -> Result<Self, ShmError> {
        Self::create_at(&shm_path(name))
    }

    /// Attach to an existing named region under `/dev/shm`, validating
    /// size, magic and version before trusting any of it.
    pub fn attach(name: &str) -> Result<Self, ShmError> {
        Self::attach_at(&shm_path(name))
    }

    /// [`SharedRegion::create`] against an explicit path (test fixtures).
    pub fn create_at(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(region_size() as u64)?;

        // SAFETY: the file was just created with the exact region size and
        // nothing else maps it yet.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut region = Self { map };

        *region.header_mut() = Header::default();
        tracing::debug!("created shared region at {}", path.display());
        Ok(region)
    }

    /// [`SharedRegion::attach`] against an explicit path (test fixtures).
    pub fn attach_at(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ShmError::NotFound(path.display().to_string()),
                _ => ShmError::Io(e),
            })?;

        let actual = file.metadata()?.len() as usize;
        if actual != region_size() {
            return Err(ShmError::SizeMismatch { expected: region_size(), actual });
        }

        // SAFETY: size was validated above; the producer owns the file and
        // only touches fields per the header's ownership protocol.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let region = Self { map };

        let header = region.header();
        if header.magic != SHM_MAGIC {
            return Err(ShmError::BadMagic { found: header.magic });
        }
        if header.version != SHM_VERSION {
            return Err(ShmError::BadVersion { found: header.version });
        }

        tracing::debug!("attached shared region at {}", path.display());
        Ok(region)
    }

    pub fn header(&self) -> &Header {
        // SAFETY: the map is at least `region_size()` bytes and page
        // aligned, which satisfies the header's 64-byte alignment. All
        // fields either tolerate any bit pattern or are written only by
        // this process.
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    /// Mutable view of the header. The other process only touches the
    /// atomic flag words while this view exists; non-atomic fields are
    /// exclusively ours between flag transitions.
    pub fn header_mut(&mut self) -> &mut Header {
        // SAFETY: as in `header`, plus the ownership protocol above.
        unsafe { &mut *(self.map.as_mut_ptr() as *mut Header) }
    }

    /// The full pixel buffer following the header.
    pub fn frame_bytes(&self) -> &[u8] {
        let start = mem::size_of::<Header>();
        &self.map[start..start + FRAME_BUFFER_SIZE]
    }

    pub fn frame_bytes_mut(&mut self) -> &mut [u8] {
        let start = mem::size_of::<Header>();
        &mut self.map[start..start + FRAME_BUFFER_SIZE]
    }

    /// Consumer view for one tick: mutable header plus the (producer
    /// written, currently quiescent) frame bytes.
    pub fn split_mut(&mut self) -> (&mut Header, &[u8]) {
        let (head, tail) = self.map.split_at_mut(mem::size_of::<Header>());
        // SAFETY: `head` is exactly the header's bytes; see `header_mut`.
        let header = unsafe { &mut *(head.as_mut_ptr() as *mut Header) };
        (header, &tail[..FRAME_BUFFER_SIZE])
    }

    /// Producer-side helper: copy one frame into the region, fill the
    /// metadata, and raise `frame_ready`.
    pub fn write_frame(
        &mut self,
        frame_number: u64,
        timestamp_ns: i64,
        width: i32,
        height: i32,
        pixels: &[u8],
    ) -> Result<(), ShmError> {
        let got = pixels.len();
        if got != (width * height * 4) as usize || got > FRAME_BUFFER_SIZE {
            return Err(ShmError::FrameOutOfBounds { got, capacity: FRAME_BUFFER_SIZE });
        }

        self.frame_bytes_mut()[..got].copy_from_slice(pixels);
        let header = self.header_mut();
        header.frame_number = frame_number;
        header.frame_timestamp_ns = timestamp_ns;
        header.frame_width = width;
        header.frame_height = height;
        header.frame_stride = width * 4;
        header.publish_frame();
        Ok(())
    }
}
