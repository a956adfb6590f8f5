use std::sync::Arc;

use crate::layer;
use crate::wire::{CastType, Ipv4Head};

/// Per-packet control block attached to every buffer the receive core handles.
///
/// `start`, `length` and `end` describe the byte range this packet covers
/// within its parent datagram; for an unfragmented datagram the range simply
/// spans the payload. The remaining fields carry the classification and
/// lifetime state the pipeline threads from validation to delivery.
#[derive(Debug, Clone, Copy)]
pub struct ClipInfo {
    /// Byte offset of this fragment within its parent datagram.
    pub start: usize,
    /// Number of payload bytes covered.
    pub length: usize,
    /// One past the last covered byte, `start + length`.
    pub end: usize,
    /// Destination classification, absent until validation computed one.
    pub cast_type: Option<CastType>,
    /// Opaque pass-through from the link layer.
    pub link_flag: u32,
    /// Aging ticks remaining; zero means the packet never expires.
    pub life: u32,
    /// The result delivered to the client alongside the packet.
    pub status: layer::Result<()>,
}

impl ClipInfo {
    fn new(length: usize) -> ClipInfo {
        ClipInfo {
            start: 0,
            length,
            end: length,
            cast_type: None,
            link_flag: 0,
            life: 0,
            status: Ok(()),
        }
    }
}

/// One physical block of packet data: a live sub-range of shared storage.
#[derive(Debug, Clone)]
struct Chunk {
    mem: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl Chunk {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn as_slice(&self) -> &[u8] {
        &self.mem[self.start..self.end]
    }
}

/// A datagram or fragment as handled by the receive core.
///
/// The buffer is a logical byte sequence over an ordered list of physical
/// blocks. Blocks reference shared storage: [`clone_shared`] produces a new
/// handle onto the same bytes, while [`duplicate`] copies them into a fresh
/// contiguous backing. The storage of a block is released when its last
/// handle goes away, which is how a reassembled datagram keeps all its
/// fragments alive exactly as long as itself.
///
/// Head-trim and tail-trim are the only mutations of the byte range. They do
/// not touch the attached [`ClipInfo`]; the pipeline stages that trim also
/// own the corresponding range bookkeeping.
///
/// [`clone_shared`]: #method.clone_shared
/// [`duplicate`]: #method.duplicate
#[derive(Debug)]
pub struct PacketBuf {
    chunks: Vec<Chunk>,
    head: Option<Ipv4Head>,
    clip: ClipInfo,
}

impl PacketBuf {
    /// Create a buffer owning the given bytes, as the link layer does on
    /// receive.
    pub fn from_vec(data: Vec<u8>) -> PacketBuf {
        let len = data.len();
        PacketBuf {
            chunks: vec![Chunk { mem: Arc::from(data), start: 0, end: len }],
            head: None,
            clip: ClipInfo::new(len),
        }
    }

    /// Build a whole datagram out of its reassembled fragments.
    ///
    /// The result owns the fragments' storage; nothing is copied. The caller
    /// provides the header view captured from the offset-zero fragment and
    /// the control block for the assembled whole.
    pub fn from_fragments(fragments: Vec<PacketBuf>, head: Ipv4Head, clip: ClipInfo) -> PacketBuf {
        let mut chunks = Vec::new();
        for fragment in fragments {
            chunks.extend(fragment.chunks);
        }
        PacketBuf { chunks, head: Some(head), clip }
    }

    /// The number of live payload bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// Whether any byte is left.
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.len() == 0)
    }

    /// The attached control block.
    pub fn clip(&self) -> &ClipInfo {
        &self.clip
    }

    /// Mutable access to the attached control block.
    pub fn clip_mut(&mut self) -> &mut ClipInfo {
        &mut self.clip
    }

    /// The parsed header view, once validation attached one.
    pub fn head(&self) -> Option<&Ipv4Head> {
        self.head.as_ref()
    }

    /// Attach the parsed header view.
    pub fn set_head(&mut self, head: Ipv4Head) {
        self.head = Some(head);
    }

    /// Drop `count` bytes from the front of the buffer.
    pub fn trim_head(&mut self, mut count: usize) {
        while count > 0 && !self.chunks.is_empty() {
            let chunk = &mut self.chunks[0];
            let take = count.min(chunk.len());
            chunk.start += take;
            count -= take;
            if chunk.len() == 0 {
                self.chunks.remove(0);
            }
        }
    }

    /// Drop `count` bytes from the back of the buffer.
    pub fn trim_tail(&mut self, mut count: usize) {
        while count > 0 && !self.chunks.is_empty() {
            let last = self.chunks.len() - 1;
            let chunk = &mut self.chunks[last];
            let take = count.min(chunk.len());
            chunk.end -= take;
            count -= take;
            if chunk.len() == 0 {
                self.chunks.pop();
            }
        }
    }

    /// Create a new handle onto the same bytes.
    ///
    /// The storage is shared; only the handle, its header view and its
    /// control block are independent of the original.
    pub fn clone_shared(&self) -> PacketBuf {
        PacketBuf {
            chunks: self.chunks.clone(),
            head: self.head.clone(),
            clip: self.clip,
        }
    }

    /// Copy the bytes into one fresh contiguous backing.
    ///
    /// `head_room` bytes are reserved in front of the payload inside the new
    /// backing so a header can later be made addressable next to the data.
    pub fn duplicate(&self, head_room: usize) -> PacketBuf {
        let len = self.len();
        let mut mem = vec![0; head_room + len];
        let copied = self.copy_to(0, &mut mem[head_room..]);
        debug_assert_eq!(copied, len);
        PacketBuf {
            chunks: vec![Chunk { mem: Arc::from(mem), start: head_room, end: head_room + len }],
            head: self.head.clone(),
            clip: self.clip,
        }
    }

    /// Whether another handle references any of this buffer's storage.
    pub fn is_shared(&self) -> bool {
        self.chunks.iter().any(|chunk| Arc::strong_count(&chunk.mem) > 1)
    }

    /// Gather-copy bytes starting at `offset` into `dest`.
    ///
    /// Returns the number of bytes copied, which is less than `dest.len()`
    /// when the buffer ends early.
    pub fn copy_to(&self, offset: usize, dest: &mut [u8]) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        for chunk in &self.chunks {
            let slice = chunk.as_slice();
            if skip >= slice.len() {
                skip -= slice.len();
                continue;
            }
            let slice = &slice[skip..];
            skip = 0;
            let take = slice.len().min(dest.len() - copied);
            dest[copied..copied + take].copy_from_slice(&slice[..take]);
            copied += take;
            if copied == dest.len() {
                break;
            }
        }
        copied
    }

    /// Export the physical payload blocks for handing the data up.
    pub fn fragment_table(&self) -> Vec<&[u8]> {
        self.chunks.iter()
            .filter(|chunk| chunk.len() > 0)
            .map(Chunk::as_slice)
            .collect()
    }
}
