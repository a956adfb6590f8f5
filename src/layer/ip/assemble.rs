use crate::storage::{ClipInfo, PacketBuf};
use crate::wire::{Ipv4Address, Ipv4Head, IpProtocol};

/// Ticks a partial datagram stays alive without completing.
///
/// The aging timer runs at a nominal 1 Hz, so this is 120 seconds from the
/// first-arrived fragment, whatever its offset.
pub const FRAGMENT_LIFE: u32 = 120;

/// Number of hash buckets in the assemble table.
///
/// A prime, so that the identification field folding into the hash spreads
/// entries even when an OS hands out sequential ids.
const ASSEMBLE_BUCKETS: usize = 127;

/// The identity of one in-flight datagram.
///
/// Fragments belong together when destination, source, identification and
/// protocol all agree; see RFC 791 § 2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    dst: Ipv4Address,
    src: Ipv4Address,
    ident: u16,
    protocol: IpProtocol,
}

impl Key {
    fn of(head: &Ipv4Head) -> Key {
        Key {
            dst: head.dst_addr,
            src: head.src_addr,
            ident: head.ident,
            protocol: head.protocol,
        }
    }

    fn bucket(&self) -> usize {
        let mix = u32::from(self.dst)
            ^ u32::from(self.src)
            ^ (u32::from(self.ident) << 16)
            ^ u32::from(u8::from(self.protocol));
        ((mix ^ (mix >> 16)) as usize) % ASSEMBLE_BUCKETS
    }
}

/// One partially assembled datagram.
///
/// The fragment list is kept strictly ordered by `start` and pairwise
/// non-overlapping; `cur_len` is the byte count over the list. `total_len`
/// stays zero until a fragment without the more-fragments flag fixes the
/// datagram's end.
#[derive(Debug)]
struct Entry {
    key: Key,
    fragments: Vec<PacketBuf>,
    total_len: usize,
    cur_len: usize,
    head: Option<Ipv4Head>,
    saved_info: Option<ClipInfo>,
    life: u32,
}

impl Entry {
    fn new(key: Key) -> Entry {
        Entry {
            key,
            fragments: Vec::new(),
            total_len: 0,
            cur_len: 0,
            head: None,
            saved_info: None,
            life: FRAGMENT_LIFE,
        }
    }

    /// Materialize the completed datagram.
    ///
    /// Concatenates the fragment storage without copying; the result owns
    /// every fragment buffer. The control block of the offset-zero fragment
    /// carries the classification over, normalized to span the whole
    /// datagram.
    fn into_datagram(self) -> Option<PacketBuf> {
        let head = self.head?;
        let mut clip = self.saved_info?;
        clip.start = 0;
        clip.length = self.total_len;
        clip.end = self.total_len;
        Some(PacketBuf::from_fragments(self.fragments, head, clip))
    }
}

/// Constrain a fragment to `[start, end)`, keeping its control block in step.
fn trim_fragment(packet: &mut PacketBuf, start: usize, end: usize) {
    let clip = *packet.clip();
    debug_assert_eq!(clip.start + clip.length, clip.end);
    debug_assert!(clip.start < end && start < clip.end);

    if clip.start < start {
        let excess = start - clip.start;
        packet.trim_head(excess);
        let clip = packet.clip_mut();
        clip.start = start;
        clip.length -= excess;
    }

    if end < packet.clip().end {
        let excess = packet.clip().end - end;
        packet.trim_tail(excess);
        let clip = packet.clip_mut();
        clip.end = end;
        clip.length -= excess;
    }
}

/// The set of in-flight datagram reassemblies.
///
/// Entries hash by their [`Key`] into a fixed bucket array. The table owns
/// its entries and each entry owns its fragment buffers until completion
/// transfers them into the materialized datagram.
#[derive(Debug)]
pub struct AssembleTable {
    buckets: Vec<Vec<Entry>>,
}

impl AssembleTable {
    /// Create an empty table.
    pub fn new() -> AssembleTable {
        AssembleTable {
            buckets: (0..ASSEMBLE_BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    /// The number of in-flight reassemblies.
    pub fn entries(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Discard every entry together with its fragments.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Take one fragment and try to complete its datagram.
    ///
    /// The fragment must already carry its parsed header and a control block
    /// describing `[start, end)`. Returns the whole datagram once every byte
    /// up to the end fixed by the final fragment has arrived; otherwise the
    /// table keeps (or discards) the fragment and returns `None`.
    ///
    /// Overlap resolution: a fragment that adds no bytes over what its
    /// neighbors already cover is discarded. When a new fragment partially
    /// overlaps the fragment before it, the older fragment is tail-trimmed
    /// so the newer bytes win their range. When it runs into a longer
    /// fragment behind it, the new fragment is tail-trimmed to stop where
    /// that one starts.
    pub fn reassemble(&mut self, mut packet: PacketBuf) -> Option<PacketBuf> {
        let head = match packet.head() {
            Some(head) => head.clone(),
            None => {
                debug_assert!(false, "fragment without a parsed header");
                return None;
            }
        };

        let key = Key::of(&head);
        let bucket = &mut self.buckets[key.bucket()];
        let at = match bucket.iter().position(|entry| entry.key == key) {
            Some(at) => at,
            None => {
                bucket.insert(0, Entry::new(key));
                0
            }
        };
        let entry = &mut bucket[at];

        // The insertion point: before the first fragment starting beyond the
        // new one. The predecessor, if any, has start <= packet.start.
        let start = packet.clip().start;
        let mut insert_at = entry.fragments.iter()
            .position(|fragment| fragment.clip().start > start)
            .unwrap_or_else(|| entry.fragments.len());

        if insert_at > 0 {
            let prev = &mut entry.fragments[insert_at - 1];
            let prev_end = prev.clip().end;
            if packet.clip().start < prev_end {
                if packet.clip().end <= prev_end {
                    net_debug!("ip4: fragment covered by an earlier one, dropped");
                    return None;
                }
                // Partial overlap: the newer bytes win their range, the
                // older fragment gives up its tail.
                let (prev_start, new_start) = (prev.clip().start, packet.clip().start);
                if prev_start == new_start {
                    // The new fragment supersedes the predecessor entirely,
                    // header capture included when it sat at offset zero.
                    if prev_start == 0 {
                        entry.head = None;
                        entry.saved_info = None;
                    }
                    entry.cur_len -= prev.clip().length;
                    entry.fragments.remove(insert_at - 1);
                    insert_at -= 1;
                } else {
                    trim_fragment(prev, prev_start, new_start);
                    entry.cur_len -= prev_end - new_start;
                }
            }
        }

        while insert_at < entry.fragments.len() {
            let (succ_start, succ_end, succ_len) = {
                let clip = entry.fragments[insert_at].clip();
                (clip.start, clip.end, clip.length)
            };

            // Swallow fragments the new one covers completely.
            if succ_end <= packet.clip().end {
                entry.fragments.remove(insert_at);
                entry.cur_len -= succ_len;
                continue;
            }

            if succ_start < packet.clip().end {
                // A longer resident fragment keeps its range; the new one
                // stops where it starts. Same-offset collisions cannot reach
                // this point: an equal start would have made the resident
                // fragment the predecessor above.
                let start = packet.clip().start;
                trim_fragment(&mut packet, start, succ_start);
            }
            break;
        }

        entry.cur_len += packet.clip().length;

        if packet.clip().start == 0 {
            // Either the first offset-zero fragment, or a longer replay
            // whose displaced predecessor cleared the stale capture above.
            debug_assert!(entry.head.is_none());
            entry.head = packet.head().cloned();
            entry.saved_info = Some(*packet.clip());
        }

        // Only the first final fragment fixes the datagram length.
        if !head.more_frags && entry.total_len == 0 {
            entry.total_len = packet.clip().end;
        }

        entry.fragments.insert(insert_at, packet);

        if entry.total_len > 0 && entry.cur_len >= entry.total_len {
            let entry = bucket.remove(at);

            // A properly formed datagram ends where the final fragment said
            // it would; anything else is a fake.
            let last_end = entry.fragments.last().map(|fragment| fragment.clip().end);
            if last_end != Some(entry.total_len) {
                net_debug!("ip4: reassembled length mismatch, dropped");
                return None;
            }

            return entry.into_datagram();
        }

        None
    }

    /// Age every entry by one tick, discarding those that ran out.
    pub fn tick(&mut self) {
        for bucket in &mut self.buckets {
            bucket.retain_mut(|entry| {
                if entry.life > 0 {
                    entry.life -= 1;
                    if entry.life == 0 {
                        net_trace!("ip4: reassembly timed out");
                        return false;
                    }
                }
                true
            });
        }
    }
}

impl Default for AssembleTable {
    fn default() -> AssembleTable {
        AssembleTable::new()
    }
}
