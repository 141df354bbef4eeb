use serde::Serialize;

use super::cache_state::CacheState;
use super::Address;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLine<M> {
    /// Block-aligned address of the line.
    pub address: Address,
    pub state: CacheState,
    pub meta: M,
    pub data: Box<[u8]>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub reads: u64,
    pub writes: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// Set-associative line storage with LRU replacement.  Protocol state is kept in the lines but
/// never interpreted here; `M` carries whatever per-line bookkeeping the owning controller needs.
#[derive(Debug)]
pub struct Cache<M> {
    name: String,
    num_sets: usize,
    block_size: usize,
    log_block_size: u32,
    sets: Vec<Vec<Option<CacheLine<M>>>>,
    // most recently used way first
    lru: Vec<Vec<usize>>,
    stats: CacheStats,
}

impl<M> Cache<M> {
    pub fn new(name: impl Into<String>, num_sets: usize, ways: usize, block_size: usize) -> Self {
        assert!(num_sets.is_power_of_two() && ways > 0 && block_size.is_power_of_two());
        let mut sets = Vec::with_capacity(num_sets);
        let mut lru = Vec::with_capacity(num_sets);
        for _ in 0..num_sets {
            sets.push((0..ways).map(|_| None).collect());
            lru.push((0..ways).collect());
        }
        Self {
            name: name.into(),
            num_sets,
            block_size,
            log_block_size: block_size.trailing_zeros(),
            sets,
            lru,
            stats: CacheStats::default(),
        }
    }

    pub fn block_address(&self, address: Address) -> Address {
        address & !(self.block_size as Address - 1)
    }

    fn set_index(&self, address: Address) -> usize {
        ((address >> self.log_block_size) as usize) & (self.num_sets - 1)
    }

    fn locate(&self, address: Address) -> Option<(usize, usize)> {
        let address = self.block_address(address);
        let set = self.set_index(address);
        self.sets[set]
            .iter()
            .position(|line| line.as_ref().is_some_and(|l| l.address == address))
            .map(|way| (set, way))
    }

    /// Line holding `address`, without touching replacement state.
    pub fn peek(&self, address: Address) -> Option<&CacheLine<M>> {
        let (set, way) = self.locate(address)?;
        self.sets[set][way].as_ref()
    }

    pub fn peek_mut(&mut self, address: Address) -> Option<&mut CacheLine<M>> {
        let (set, way) = self.locate(address)?;
        self.sets[set][way].as_mut()
    }

    pub fn state(&self, address: Address) -> CacheState {
        self.peek(address).map_or(CacheState::Invalid, |line| line.state)
    }

    /// Copies `buf.len()` bytes at `offset` out of the line and marks it most recently used.
    pub fn read(&mut self, address: Address, offset: usize, buf: &mut [u8]) -> &mut CacheLine<M> {
        self.stats.reads += 1;
        let line = self.touch_line(address, offset, buf.len());
        buf.copy_from_slice(&line.data[offset..offset + buf.len()]);
        line
    }

    pub fn write(&mut self, address: Address, offset: usize, data: &[u8]) -> &mut CacheLine<M> {
        self.stats.writes += 1;
        let line = self.touch_line(address, offset, data.len());
        line.data[offset..offset + data.len()].copy_from_slice(data);
        line
    }

    fn touch_line(&mut self, address: Address, offset: usize, len: usize) -> &mut CacheLine<M> {
        assert!(
            offset + len <= self.block_size,
            "{}: access of {} bytes at offset {} crosses a {}-byte line",
            self.name,
            len,
            offset,
            self.block_size
        );
        let Some((set, way)) = self.locate(address) else {
            panic!("{}: access to absent line {:#x}", self.name, address);
        };
        self.touch(set, way);
        match self.sets[set][way].as_mut() {
            Some(line) => line,
            None => panic!("{}: way {} of set {} emptied during access", self.name, way, set),
        }
    }

    /// Fills a line, returning the least recently used line of the set if one had to go.
    pub fn insert(&mut self, address: Address, state: CacheState, meta: M, data: Vec<u8>) -> Option<CacheLine<M>> {
        let address = self.block_address(address);
        assert!(self.locate(address).is_none(), "{}: {:#x} inserted twice", self.name, address);
        assert_eq!(data.len(), self.block_size, "{}: fill of {:#x} with a partial line", self.name, address);
        assert!(state.readable(), "{}: fill of {:#x} in state {:?}", self.name, address, state);

        let set = self.set_index(address);
        let (way, evicted) = match self.sets[set].iter().position(Option::is_none) {
            Some(way) => (way, None),
            None => {
                let way = *self.lru[set].last().unwrap_or(&0);
                self.stats.evictions += 1;
                (way, self.sets[set][way].take())
            }
        };
        self.sets[set][way] = Some(CacheLine {
            address,
            state,
            meta,
            data: data.into_boxed_slice(),
        });
        self.touch(set, way);
        self.stats.insertions += 1;
        evicted
    }

    pub fn invalidate(&mut self, address: Address) -> Option<CacheLine<M>> {
        let (set, way) = self.locate(address)?;
        self.stats.invalidations += 1;
        // the freed way is the next one to fill
        let order = &mut self.lru[set];
        if let Some(pos) = order.iter().position(|&w| w == way) {
            order.remove(pos);
        }
        order.push(way);
        self.sets[set][way].take()
    }

    pub fn set_state(&mut self, address: Address, state: CacheState) {
        match self.peek_mut(address) {
            Some(line) => line.state = state,
            None => panic!("{}: setting state of absent line {:#x}", self.name, address),
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &CacheLine<M>> {
        self.sets.iter().flatten().flatten()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn touch(&mut self, set: usize, way: usize) {
        let order = &mut self.lru[set];
        if let Some(pos) = order.iter().position(|&w| w == way) {
            order.remove(pos);
        }
        order.insert(0, way);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(byte: u8) -> Vec<u8> {
        vec![byte; 16]
    }

    #[test]
    fn lru_line_is_evicted() {
        let mut cache: Cache<()> = Cache::new("test", 1, 2, 16);
        assert!(cache.insert(0x00, CacheState::Shared, (), line(0)).is_none());
        assert!(cache.insert(0x10, CacheState::Shared, (), line(1)).is_none());
        let mut buf = [0u8; 4];
        cache.read(0x00, 0, &mut buf);
        let evicted = cache.insert(0x20, CacheState::Modified, (), line(2)).unwrap();
        assert_eq!(evicted.address, 0x10);
        assert_eq!(evicted.data[0], 1);
        assert_eq!(cache.state(0x00), CacheState::Shared);
        assert_eq!(cache.state(0x10), CacheState::Invalid);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn partial_accesses_within_a_line() {
        let mut cache: Cache<u32> = Cache::new("test", 4, 1, 16);
        cache.insert(0x35, CacheState::Modified, 0, line(0));
        cache.write(0x30, 4, &[1, 2, 3]).meta += 1;
        let mut buf = [0u8; 5];
        cache.read(0x3F, 3, &mut buf);
        assert_eq!(buf, [0, 1, 2, 3, 0]);
        assert_eq!(cache.peek(0x30).unwrap().meta, 1);
        assert_eq!(cache.peek(0x30).unwrap().address, 0x30);
    }

    #[test]
    fn invalidated_way_is_refilled_first() {
        let mut cache: Cache<()> = Cache::new("test", 1, 2, 16);
        cache.insert(0x00, CacheState::Shared, (), line(0));
        cache.insert(0x10, CacheState::Shared, (), line(1));
        assert!(cache.invalidate(0x00).is_some());
        assert!(cache.invalidate(0x00).is_none());
        assert!(cache.insert(0x20, CacheState::Shared, (), line(2)).is_none());
        assert_eq!(cache.lines().count(), 2);
    }

    #[test]
    #[should_panic(expected = "test: access to absent line 0x40")]
    fn access_to_absent_line_is_fatal() {
        let mut cache: Cache<()> = Cache::new("test", 2, 2, 16);
        cache.write(0x40, 0, &[1]);
    }

    #[test]
    #[should_panic(expected = "crosses a 16-byte line")]
    fn access_crossing_a_line_is_fatal() {
        let mut cache: Cache<()> = Cache::new("test", 2, 2, 16);
        cache.insert(0x00, CacheState::Shared, (), line(0));
        let mut buf = [0u8; 8];
        cache.read(0x00, 12, &mut buf);
    }
}
