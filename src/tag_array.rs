use crate::{config, instruction::Block};

pub trait AddressTranslation: std::fmt::Debug {
    /// Compute cache line tag for an address.
    #[must_use]
    fn tag(&self, addr: u32) -> u32;

    /// Compute block address for an address.
    #[must_use]
    fn block_addr(&self, addr: u32) -> u32;

    /// Compute set index for an address.
    #[must_use]
    fn set_index(&self, addr: u32) -> usize;
}

/// Consecutive blocks map to consecutive sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    pub block_size: u32,
    pub num_sets: usize,
}

impl AddressTranslation for Linear {
    #[inline]
    fn tag(&self, addr: u32) -> u32 {
        // the tag keeps the set bits so every block address has a unique tag
        self.block_addr(addr)
    }

    #[inline]
    fn block_addr(&self, addr: u32) -> u32 {
        addr & !(self.block_size - 1)
    }

    #[inline]
    fn set_index(&self, addr: u32) -> usize {
        (addr / self.block_size) as usize % self.num_sets
    }
}

/// Consecutive blocks are interleaved over banks, then over the sets of a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Banked {
    pub block_size: u32,
    pub num_banks: usize,
    /// Sets per bank.
    pub num_sets: usize,
}

impl Banked {
    #[must_use]
    pub fn bank(&self, addr: u32) -> usize {
        (addr / self.block_size) as usize % self.num_banks
    }
}

impl AddressTranslation for Banked {
    #[inline]
    fn tag(&self, addr: u32) -> u32 {
        self.block_addr(addr)
    }

    #[inline]
    fn block_addr(&self, addr: u32) -> u32 {
        addr & !(self.block_size - 1)
    }

    #[inline]
    fn set_index(&self, addr: u32) -> usize {
        (addr / self.block_size) as usize / self.num_banks % self.num_sets
    }
}

#[derive(Debug, strum::Display, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Status {
    INVALID,
    VALID,
    /// Valid and written since the fill.
    MODIFIED,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub tag: u32,
    pub block_addr: u32,
    pub status: Status,
    pub alloc_time: u64,
    pub last_access_time: u64,
    pub data: Block,
}

impl Default for Line {
    fn default() -> Self {
        Self {
            tag: 0,
            block_addr: 0,
            status: Status::INVALID,
            alloc_time: 0,
            last_access_time: 0,
            data: Block::new(),
        }
    }
}

impl Line {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status != Status::INVALID
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.status == Status::MODIFIED
    }
}

/// A valid line displaced by a fill or written back by a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedBlock {
    pub block_addr: u32,
    pub modified: bool,
    pub data: Block,
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Line(block={:#010x}, {}, alloc={}, last_access={})",
            self.block_addr, self.status, self.alloc_time, self.last_access_time
        )
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ProbeStatus {
    HIT,
    MISS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessStatus {
    /// Line holding the block on a hit, the victim on a miss.
    pub index: usize,
    pub status: ProbeStatus,
}

/// Set associative tag store.
///
/// Lines are laid out set after set. Blocks are allocated when their fill
/// arrives, never on the miss itself.
#[derive(Debug)]
pub struct TagArray<T = Linear> {
    lines: Vec<Line>,
    associativity: usize,
    replacement_policy: config::CacheReplacementPolicy,
    addr_translation: T,
    num_access: u64,
    num_miss: u64,
    num_fill: u64,
    num_dirty: usize,
}

/// Mixes the victim selection inputs (splitmix64 finalizer).
fn mix(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl TagArray<Linear> {
    #[must_use]
    pub fn new(config: &config::ICache) -> Self {
        let num_sets = config.num_sets();
        Self::with_translation(
            num_sets,
            config.associativity,
            config.replacement_policy,
            Linear {
                block_size: config.block_size as u32,
                num_sets,
            },
        )
    }
}

impl<T> TagArray<T> {
    #[must_use]
    pub fn with_translation(
        num_sets: usize,
        associativity: usize,
        replacement_policy: config::CacheReplacementPolicy,
        addr_translation: T,
    ) -> Self {
        Self {
            lines: (0..num_sets * associativity).map(|_| Line::default()).collect(),
            associativity,
            replacement_policy,
            addr_translation,
            num_access: 0,
            num_miss: 0,
            num_fill: 0,
            num_dirty: 0,
        }
    }
}

impl<T> TagArray<T>
where
    T: AddressTranslation,
{
    #[must_use]
    pub fn block_addr(&self, addr: u32) -> u32 {
        self.addr_translation.block_addr(addr)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn line(&self, idx: usize) -> &Line {
        &self.lines[idx]
    }

    #[must_use]
    pub fn num_access(&self) -> u64 {
        self.num_access
    }

    #[must_use]
    pub fn num_miss(&self) -> u64 {
        self.num_miss
    }

    #[must_use]
    pub fn num_dirty(&self) -> usize {
        self.num_dirty
    }

    #[must_use]
    pub fn addr_translation(&self) -> &T {
        &self.addr_translation
    }

    /// Data of a valid line, to be modified in place by a write.
    ///
    /// The line becomes [`Status::MODIFIED`].
    pub fn write_line(&mut self, idx: usize) -> &mut Block {
        let line = &mut self.lines[idx];
        if line.status == Status::VALID {
            line.status = Status::MODIFIED;
            self.num_dirty += 1;
        }
        &mut line.data
    }

    /// Looks up `addr` without touching replacement state.
    ///
    /// On a miss the returned index is the line a fill would replace:
    /// the first invalid way, otherwise the least recently used (LRU),
    /// oldest allocated (FIFO) or a hashed (RANDOM) way.
    #[must_use]
    pub fn probe(&self, addr: u32) -> AccessStatus {
        let set_index = self.addr_translation.set_index(addr);
        let tag = self.addr_translation.tag(addr);
        let ways = set_index * self.associativity..(set_index + 1) * self.associativity;

        let mut invalid_line = None;
        let mut valid_line = None;
        let mut valid_time = u64::MAX;

        for idx in ways {
            let line = &self.lines[idx];
            if line.is_valid() && line.tag == tag {
                return AccessStatus {
                    index: idx,
                    status: ProbeStatus::HIT,
                };
            }
            if !line.is_valid() {
                invalid_line = invalid_line.or(Some(idx));
                continue;
            }
            let time = match self.replacement_policy {
                config::CacheReplacementPolicy::LRU => line.last_access_time,
                config::CacheReplacementPolicy::FIFO => line.alloc_time,
                config::CacheReplacementPolicy::RANDOM => continue,
            };
            if time < valid_time {
                valid_time = time;
                valid_line = Some(idx);
            }
        }

        log::trace!(
            "tag_array::probe({:#010x}) set={} invalid_line={:?} valid_line={:?} ({:?} policy)",
            addr,
            set_index,
            invalid_line,
            valid_line,
            self.replacement_policy
        );

        if self.replacement_policy == config::CacheReplacementPolicy::RANDOM {
            let way = mix((u64::from(tag) << 32) ^ self.num_fill) % self.associativity as u64;
            valid_line = Some(set_index * self.associativity + way as usize);
        }

        AccessStatus {
            // a set always has at least one way
            index: invalid_line.or(valid_line).unwrap_or(set_index * self.associativity),
            status: ProbeStatus::MISS,
        }
    }

    /// Probes and updates the access time of a hit.
    pub fn access(&mut self, addr: u32, time: u64) -> AccessStatus {
        self.num_access += 1;
        let status = self.probe(addr);
        match status.status {
            ProbeStatus::HIT => self.lines[status.index].last_access_time = time,
            ProbeStatus::MISS => self.num_miss += 1,
        }
        status
    }

    /// Installs the block containing `addr`.
    ///
    /// Returns the block address of a valid line that was evicted.
    pub fn fill(&mut self, addr: u32, data: Block, time: u64) -> Option<u32> {
        self.fill_line(addr, data, time).map(|evicted| evicted.block_addr)
    }

    /// Installs the block containing `addr` and hands back the line it displaced.
    ///
    /// Refilling a resident block replaces its data and keeps it clean.
    pub fn fill_line(&mut self, addr: u32, data: Block, time: u64) -> Option<EvictedBlock> {
        let status = self.probe(addr);
        let line = &mut self.lines[status.index];
        if line.is_modified() {
            self.num_dirty -= 1;
        }
        if status.status == ProbeStatus::HIT {
            line.data = data;
            line.status = Status::VALID;
            line.last_access_time = time;
            return None;
        }
        let evicted = line.is_valid().then(|| EvictedBlock {
            block_addr: line.block_addr,
            modified: line.is_modified(),
            data: std::mem::take(&mut line.data),
        });
        self.num_fill += 1;
        log::trace!(
            "tag_array::fill(line={}, block={:#010x}, time={}) evicts {:?}",
            status.index,
            self.addr_translation.block_addr(addr),
            time,
            evicted.as_ref().map(|evicted| evicted.block_addr)
        );
        *line = Line {
            tag: self.addr_translation.tag(addr),
            block_addr: self.addr_translation.block_addr(addr),
            status: Status::VALID,
            alloc_time: time,
            last_access_time: time,
            data,
        };
        evicted
    }

    /// Cleans every modified line and returns their contents.
    pub fn flush(&mut self) -> Vec<EvictedBlock> {
        self.num_dirty = 0;
        self.lines
            .iter_mut()
            .filter(|line| line.is_modified())
            .map(|line| {
                line.status = Status::VALID;
                EvictedBlock {
                    block_addr: line.block_addr,
                    modified: true,
                    data: line.data.clone(),
                }
            })
            .collect()
    }

    /// Invalidates all lines.
    pub fn invalidate(&mut self) {
        self.num_dirty = 0;
        for line in &mut self.lines {
            line.status = Status::INVALID;
        }
    }
}
