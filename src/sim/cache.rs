//! The memory bus and the program-memory cache.
//!
//! The [`Bus`] holds the two 64KB address spaces (PROGRAM and DATA) and is the
//! ground truth for both. DATA memory is accessed through the bus directly,
//! while PROGRAM memory accesses go through a [`Cache`].
//!
//! The cache is configured with a [`CacheConfig`]:
//! - [`Placement`]: where a byte may be held (direct-mapped or fully associative).
//! - [`WritePolicy`]: when writes reach the bus (write-back or write-through).
//!
//! Every line carries a recency rank. The ranks of all lines are always
//! a permutation of `0..N`, where `N - 1` is the most recently used line.

use super::mem::{ByteFiller, MemArray};

/// One of the two byte-addressed memory spaces.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Space {
    /// PROGRAM memory, holding code, vectors and lookup tables.
    Program,
    /// DATA (external) memory.
    Data,
}

/// The memory bus, holding PROGRAM and DATA memory.
#[derive(Debug, Clone)]
pub struct Bus {
    /// PROGRAM memory.
    pub program: MemArray,
    /// DATA memory.
    pub data: MemArray,
}
impl Bus {
    /// Creates a bus, filling both spaces with the filler.
    pub fn new(filler: &mut impl ByteFiller) -> Self {
        Self {
            program: MemArray::new(filler),
            data: MemArray::new(filler),
        }
    }

    /// Reads a byte from the given space.
    pub fn read(&self, space: Space, addr: u16) -> u8 {
        self.space(space)[addr]
    }
    /// Writes a byte to the given space.
    pub fn write(&mut self, space: Space, addr: u16, value: u8) {
        self.space_mut(space)[addr] = value;
    }

    /// Gets the memory array backing a space.
    pub fn space(&self, space: Space) -> &MemArray {
        match space {
            Space::Program => &self.program,
            Space::Data => &self.data,
        }
    }
    /// Gets the memory array backing a space, mutably.
    pub fn space_mut(&mut self, space: Space) -> &mut MemArray {
        match space {
            Space::Program => &mut self.program,
            Space::Data => &mut self.data,
        }
    }
}

/// Where a byte may be placed in the cache.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Placement {
    /// Each address maps to exactly one line, `addr % N`.
    Direct,
    /// Any address may be held by any line.
    /// On a miss, the least recently used line is replaced.
    #[default]
    Associative,
}

/// When writes reach the bus.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum WritePolicy {
    /// Writes only mark the line dirty.
    /// A dirty line reaches the bus when it is evicted or the cache is flushed.
    #[default]
    WriteBack,
    /// Every write is immediately mirrored to the bus.
    WriteThrough,
}

/// Configuration of a [`Cache`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct CacheConfig {
    /// Number of lines. A value of 0 is treated as 1.
    pub lines: usize,
    /// Placement policy.
    pub placement: Placement,
    /// Write policy.
    pub write_policy: WritePolicy,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lines: 32,
            placement: Placement::Associative,
            write_policy: WritePolicy::WriteBack,
        }
    }
}

/// A single cache line, holding one byte.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CacheLine {
    /// The address held by this line, if any.
    pub tag: Option<u16>,
    /// The cached byte.
    pub data: u8,
    /// Whether the byte differs from the bus (write-back only).
    pub dirty: bool,
    /// Recency rank. The most recently used line has the highest rank.
    pub rank: usize,
}

/// Access counters of a [`Cache`].
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct CacheStats {
    /// Accesses that found their address in a line.
    pub hits: u64,
    /// Accesses that had to install their address in a line.
    pub misses: u64,
    /// Dirty lines written to the bus.
    pub write_backs: u64,
}

/// A cache in front of PROGRAM memory.
///
/// ```
/// use z8_sim::sim::cache::{Bus, Cache, CacheConfig, Space};
///
/// let mut bus = Bus::new(&mut 0u8);
/// let mut cache = Cache::new(CacheConfig::default());
///
/// cache.write(&mut bus, 0x0100, 0xAB);
/// assert_eq!(cache.read(&mut bus, 0x0100), 0xAB);
/// assert_eq!(bus.read(Space::Program, 0x0100), 0x00); // still only in the cache
///
/// cache.flush(&mut bus);
/// assert_eq!(bus.read(Space::Program, 0x0100), 0xAB);
/// ```
#[derive(Debug, Clone)]
pub struct Cache {
    config: CacheConfig,
    lines: Vec<CacheLine>,

    /// Access counters.
    pub stats: CacheStats,
}

impl Cache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        let mut cache = Self { config, lines: vec![], stats: CacheStats::default() };
        cache.invalidate();
        cache
    }

    /// The configuration of this cache.
    pub fn config(&self) -> CacheConfig {
        self.config
    }
    /// The lines of this cache.
    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    /// Drops every line (without writing any back) and resets the counters.
    pub fn invalidate(&mut self) {
        let n = self.config.lines.max(1);
        self.lines = (0..n)
            .map(|rank| CacheLine { tag: None, data: 0, dirty: false, rank })
            .collect();
        self.stats = CacheStats::default();
    }

    /// Reads a byte of PROGRAM memory.
    pub fn read(&mut self, bus: &mut Bus, addr: u16) -> u8 {
        let idx = match self.lookup(addr) {
            Some(idx) => idx,
            None => {
                let idx = self.replace(bus, addr);
                self.lines[idx].data = bus.read(Space::Program, addr);
                idx
            }
        };

        self.promote(idx);
        self.lines[idx].data
    }

    /// Writes a byte of PROGRAM memory.
    pub fn write(&mut self, bus: &mut Bus, addr: u16, value: u8) {
        let idx = match self.lookup(addr) {
            Some(idx) => idx,
            None => self.replace(bus, addr),
        };

        let line = &mut self.lines[idx];
        line.data = value;
        match self.config.write_policy {
            WritePolicy::WriteBack => line.dirty = true,
            WritePolicy::WriteThrough => bus.write(Space::Program, addr, value),
        }
        self.promote(idx);
    }

    /// Writes every dirty line back to the bus.
    ///
    /// The lines stay valid (and are now clean).
    pub fn flush(&mut self, bus: &mut Bus) {
        for line in &mut self.lines {
            if let (Some(tag), true) = (line.tag, line.dirty) {
                bus.write(Space::Program, tag, line.data);
                line.dirty = false;
                self.stats.write_backs += 1;
            }
        }
    }

    /// Finds the line holding the given address, counting a hit if found.
    fn lookup(&mut self, addr: u16) -> Option<usize> {
        let found = match self.config.placement {
            Placement::Direct => {
                let idx = usize::from(addr) % self.lines.len();
                Some(idx).filter(|&i| self.lines[i].tag == Some(addr))
            },
            Placement::Associative => self.lines.iter().position(|l| l.tag == Some(addr)),
        };

        if found.is_some() {
            self.stats.hits += 1;
        }
        found
    }

    /// Chooses a victim line for the given address, evicts it, and tags it with the address.
    ///
    /// This counts a miss. The line's data is left for the caller to fill.
    fn replace(&mut self, bus: &mut Bus, addr: u16) -> usize {
        self.stats.misses += 1;

        let idx = match self.config.placement {
            Placement::Direct => usize::from(addr) % self.lines.len(),
            Placement::Associative => self.lines.iter()
                .position(|l| l.rank == 0)
                .unwrap_or(0),
        };

        let line = &mut self.lines[idx];
        if let (Some(tag), true) = (line.tag, line.dirty) {
            log::debug!("cache: evicting dirty line {idx} ({tag:04X}) for {addr:04X}");
            bus.write(Space::Program, tag, line.data);
            self.stats.write_backs += 1;
        }
        line.tag = Some(addr);
        line.dirty = false;

        idx
    }

    /// Marks a line as the most recently used.
    fn promote(&mut self, idx: usize) {
        let prior = self.lines[idx].rank;
        for line in &mut self.lines {
            if line.rank > prior {
                line.rank -= 1;
            }
        }
        self.lines[idx].rank = self.lines.len() - 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn setup(lines: usize, placement: Placement, write_policy: WritePolicy) -> (Bus, Cache) {
        let mut bus = Bus::new(&mut 0u8);
        for (i, b) in (0..=0xFFFF).zip((0..=255u8).cycle()) {
            bus.write(Space::Program, i, b);
        }
        (bus, Cache::new(CacheConfig { lines, placement, write_policy }))
    }

    fn assert_ranks_permutation(cache: &Cache) {
        let mut ranks: Vec<_> = cache.lines().iter().map(|l| l.rank).collect();
        ranks.sort_unstable();
        assert!(ranks.into_iter().eq(0..cache.lines().len()), "ranks are not a permutation");
    }

    #[test]
    fn test_read_hits_and_misses() {
        let (mut bus, mut cache) = setup(4, Placement::Associative, WritePolicy::WriteBack);
        assert_eq!(cache.read(&mut bus, 0x1234), 0x34);
        assert_eq!(cache.read(&mut bus, 0x1234), 0x34);
        assert_eq!(cache.stats, CacheStats { hits: 1, misses: 1, write_backs: 0 });
    }

    #[test]
    fn test_lru_eviction() {
        let (mut bus, mut cache) = setup(2, Placement::Associative, WritePolicy::WriteBack);
        cache.read(&mut bus, 0x10);
        cache.read(&mut bus, 0x20);
        cache.read(&mut bus, 0x10); // 0x20 is now least recent
        cache.read(&mut bus, 0x30);

        let tags: Vec<_> = cache.lines().iter().map(|l| l.tag).collect();
        assert!(tags.contains(&Some(0x10)));
        assert!(tags.contains(&Some(0x30)));
        assert!(!tags.contains(&Some(0x20)));
        assert_ranks_permutation(&cache);
    }

    #[test]
    fn test_direct_conflict() {
        let (mut bus, mut cache) = setup(8, Placement::Direct, WritePolicy::WriteBack);
        cache.write(&mut bus, 0x0003, 0xEE);
        // 0x000B maps to the same line, forcing the dirty byte out
        cache.read(&mut bus, 0x000B);

        assert_eq!(bus.read(Space::Program, 0x0003), 0xEE);
        assert_eq!(cache.stats.write_backs, 1);
        assert_eq!(cache.lines()[3].tag, Some(0x000B));
    }

    #[test]
    fn test_empty_line_never_matches() {
        let (mut bus, mut cache) = setup(4, Placement::Associative, WritePolicy::WriteBack);
        cache.read(&mut bus, 0xFFFF);
        assert_eq!(cache.stats.misses, 1);
        assert_eq!(cache.stats.hits, 0);
    }

    #[test]
    fn test_write_through_mirrors() {
        let (mut bus, mut cache) = setup(4, Placement::Direct, WritePolicy::WriteThrough);
        cache.write(&mut bus, 0x4000, 0x99);
        assert_eq!(bus.read(Space::Program, 0x4000), 0x99);
        assert!(cache.lines().iter().all(|l| !l.dirty));
    }

    #[test]
    fn test_zero_lines() {
        let (mut bus, mut cache) = setup(0, Placement::Direct, WritePolicy::WriteBack);
        assert_eq!(cache.lines().len(), 1);
        assert_eq!(cache.read(&mut bus, 0x0102), 0x02);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Read(u16),
        Write(u16, u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        // A small address range so lines actually collide.
        prop_oneof![
            (0..64u16).prop_map(Op::Read),
            (0..64u16, any::<u8>()).prop_map(|(a, v)| Op::Write(a, v)),
        ]
    }

    fn config() -> impl Strategy<Value = CacheConfig> {
        (
            1..10usize,
            prop_oneof![Just(Placement::Direct), Just(Placement::Associative)],
            prop_oneof![Just(WritePolicy::WriteBack), Just(WritePolicy::WriteThrough)],
        ).prop_map(|(lines, placement, write_policy)| CacheConfig { lines, placement, write_policy })
    }

    proptest! {
        #[test]
        fn test_cache_invariants(config in config(), ops in prop::collection::vec(op(), 0..200)) {
            let mut bus = Bus::new(&mut 0u8);
            let mut cache = Cache::new(config);
            let mut model: HashMap<u16, u8> = HashMap::new();

            for op in ops {
                match op {
                    Op::Read(a) => {
                        let expected = model.get(&a).copied().unwrap_or(0);
                        prop_assert_eq!(cache.read(&mut bus, a), expected);
                    },
                    Op::Write(a, v) => {
                        cache.write(&mut bus, a, v);
                        model.insert(a, v);
                    },
                }

                let mut ranks: Vec<_> = cache.lines().iter().map(|l| l.rank).collect();
                ranks.sort_unstable();
                prop_assert!(ranks.into_iter().eq(0..cache.lines().len()));

                let mut tags: Vec<_> = cache.lines().iter().filter_map(|l| l.tag).collect();
                let len = tags.len();
                tags.sort_unstable();
                tags.dedup();
                prop_assert_eq!(tags.len(), len);

                if config.write_policy == WritePolicy::WriteThrough {
                    for (&a, &v) in &model {
                        prop_assert_eq!(bus.read(Space::Program, a), v);
                    }
                }
            }

            cache.flush(&mut bus);
            for (&a, &v) in &model {
                prop_assert_eq!(bus.read(Space::Program, a), v);
            }
        }
    }
}
