use std::collections::HashMap;
use std::io::{self, Write};

use serde::Serialize;

use super::directory_entry::{DirectoryEntry, SharerScheme};
use super::Address;

/// Index of an entry in the directory arena.
pub type EntryId = usize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryCacheStats {
    pub replacements: u64,
    pub max_set_replacements: u64,
    pub busiest_set: Option<usize>,
    pub most_replaced_address: Option<Address>,
    pub most_replaced_times: u64,
}

/// Set-associative store of directory entries.
///
/// Entries live in an arena; each set slot names the arena entry currently bound to it.  An entry
/// pushed out of its slot moves to the replaced map and keeps its arena id until its address has
/// been nullified, so nothing mid-eviction is ever reused.
#[derive(Debug)]
pub struct DramDirectoryCache {
    num_sets: usize,
    associativity: usize,
    log_block_size: u32,
    log_num_dram_cntlrs: u32,
    scheme: SharerScheme,
    entries: Vec<DirectoryEntry>,
    slots: Vec<EntryId>,
    free: Vec<EntryId>,
    replaced: HashMap<Address, EntryId>,
    set_replacements: Vec<u64>,
    replaced_addresses: HashMap<Address, u64>,
}

impl DramDirectoryCache {
    pub fn new(
        total_entries: usize,
        associativity: usize,
        block_size: usize,
        num_dram_cntlrs: usize,
        scheme: SharerScheme,
    ) -> Self {
        assert!(associativity > 0 && total_entries % associativity == 0);
        let num_sets = total_entries / associativity;
        assert!(num_sets.is_power_of_two(), "directory set count {} must be a power of two", num_sets);
        assert!(block_size.is_power_of_two() && num_dram_cntlrs.is_power_of_two());

        let entries: Vec<_> = (0..total_entries).map(|_| DirectoryEntry::new(scheme)).collect();
        Self {
            num_sets,
            associativity,
            log_block_size: block_size.trailing_zeros(),
            log_num_dram_cntlrs: num_dram_cntlrs.trailing_zeros(),
            scheme,
            entries,
            slots: (0..total_entries).collect(),
            free: Vec::new(),
            replaced: HashMap::new(),
            set_replacements: vec![0; num_sets],
            replaced_addresses: HashMap::new(),
        }
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    pub fn associativity(&self) -> usize {
        self.associativity
    }

    // block index, minus the bits that pick the home controller
    pub fn set_index(&self, address: Address) -> usize {
        let block = address >> self.log_block_size;
        ((block >> self.log_num_dram_cntlrs) as usize) & (self.num_sets - 1)
    }

    fn set_slots(&self, set: usize) -> std::ops::Range<usize> {
        set * self.associativity..(set + 1) * self.associativity
    }

    /// Entry currently tracking `address`, in its set or mid-replacement.
    pub fn find(&self, address: Address) -> Option<EntryId> {
        let set = self.set_index(address);
        self.slots[self.set_slots(set)]
            .iter()
            .copied()
            .find(|&id| self.entries[id].address() == Some(address))
            .or_else(|| self.replaced.get(&address).copied())
    }

    /// Tag match, else claim a free slot in the set, else the replaced map.  `None` means the
    /// caller has to replace an entry first.
    pub fn get_directory_entry(&mut self, address: Address) -> Option<EntryId> {
        let set = self.set_index(address);
        let range = self.set_slots(set);
        if let Some(id) = self.slots[range.clone()]
            .iter()
            .copied()
            .find(|&id| self.entries[id].address() == Some(address))
        {
            return Some(id);
        }

        if let Some(id) = self.slots[range]
            .iter()
            .copied()
            .find(|&id| self.entries[id].address().is_none())
        {
            self.entries[id].reset(Some(address));
            return Some(id);
        }

        self.replaced.get(&address).copied()
    }

    /// Entries of the set `address` maps to, in slot order.
    pub fn replacement_candidates(&self, address: Address) -> Vec<EntryId> {
        let set = self.set_index(address);
        self.slots[self.set_slots(set)].to_vec()
    }

    /// Moves the entry for `replaced_address` to the replaced map and binds a fresh entry for
    /// `address` to its slot.
    pub fn replace_directory_entry(&mut self, replaced_address: Address, address: Address) -> EntryId {
        let set = self.set_index(replaced_address);
        assert_eq!(
            set,
            self.set_index(address),
            "replacing {:#x} with {:#x} across sets",
            replaced_address,
            address
        );
        let slot = match self
            .set_slots(set)
            .find(|&slot| self.entries[self.slots[slot]].address() == Some(replaced_address))
        {
            Some(slot) => slot,
            None => panic!("directory: {:#x} is not resident in set {}", replaced_address, set),
        };

        let victim = self.slots[slot];
        let previous = self.replaced.insert(replaced_address, victim);
        assert!(previous.is_none(), "directory: {:#x} replaced twice", replaced_address);

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.entries.push(DirectoryEntry::new(self.scheme));
                self.entries.len() - 1
            }
        };
        self.entries[id].reset(Some(address));
        self.slots[slot] = id;

        self.set_replacements[set] += 1;
        *self.replaced_addresses.entry(replaced_address).or_default() += 1;
        id
    }

    /// Retires a replaced entry once its address is fully nullified.
    pub fn invalidate_directory_entry(&mut self, address: Address) {
        let id = match self.replaced.remove(&address) {
            Some(id) => id,
            None => panic!("directory: invalidating {:#x}, which is not being replaced", address),
        };
        self.entries[id].reset(None);
        self.free.push(id);
    }

    pub fn entry(&self, id: EntryId) -> &DirectoryEntry {
        &self.entries[id]
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut DirectoryEntry {
        &mut self.entries[id]
    }

    pub fn stats(&self) -> DirectoryCacheStats {
        let (busiest_set, max_set_replacements) = self
            .set_replacements
            .iter()
            .copied()
            .enumerate()
            .max_by_key(|&(_, n)| n)
            .filter(|&(_, n)| n > 0)
            .map_or((None, 0), |(set, n)| (Some(set), n));
        let most_replaced = self
            .replaced_addresses
            .iter()
            .max_by_key(|&(addr, n)| (*n, std::cmp::Reverse(*addr)));
        DirectoryCacheStats {
            replacements: self.set_replacements.iter().sum(),
            max_set_replacements,
            busiest_set,
            most_replaced_address: most_replaced.map(|(addr, _)| *addr),
            most_replaced_times: most_replaced.map_or(0, |(_, n)| *n),
        }
    }

    pub fn output_summary(&self, out: &mut impl Write) -> io::Result<()> {
        let stats = self.stats();
        writeln!(out, "  Dram Directory Cache:")?;
        writeln!(out, "    Total Replacements: {}", stats.replacements)?;
        writeln!(
            out,
            "    Mean Replacements per Set: {:.2}",
            stats.replacements as f64 / self.num_sets as f64
        )?;
        if let Some(set) = stats.busiest_set {
            writeln!(out, "    Max Replacements: {} (set {})", stats.max_set_replacements, set)?;
        }
        if let Some(addr) = stats.most_replaced_address {
            writeln!(out, "    Most Replaced Address: {:#x} ({} times)", addr, stats.most_replaced_times)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::directory_entry::DirectoryState;

    // 2 sets x 2 ways, 64 B blocks, one controller
    fn small() -> DramDirectoryCache {
        DramDirectoryCache::new(4, 2, 64, 1, SharerScheme::full_map(4))
    }

    #[test]
    fn set_index_skips_controller_bits() {
        let one = DramDirectoryCache::new(16, 2, 64, 1, SharerScheme::full_map(4));
        let four = DramDirectoryCache::new(16, 2, 64, 4, SharerScheme::full_map(4));
        assert_eq!(one.set_index(0x40 * 5), 5);
        assert_eq!(four.set_index(0x40 * 5), 1);
        assert_eq!(four.set_index(0x40 * 4 * 3), 3);
    }

    #[test]
    fn claims_free_slots_then_reports_full() {
        let mut dir = small();
        let a = dir.get_directory_entry(0x000).unwrap();
        let b = dir.get_directory_entry(0x080).unwrap();
        assert_ne!(a, b);
        assert_eq!(dir.get_directory_entry(0x000), Some(a));
        // third address in set 0
        assert_eq!(dir.get_directory_entry(0x100), None);
        // set 1 is untouched
        assert!(dir.get_directory_entry(0x040).is_some());
        assert_eq!(dir.replacement_candidates(0x100), vec![a, b]);
    }

    #[test]
    fn replaced_entry_stays_reachable_until_invalidated() {
        let mut dir = small();
        let victim = dir.get_directory_entry(0x000).unwrap();
        dir.entry_mut(victim).grant_shared(3);
        dir.get_directory_entry(0x080).unwrap();

        let fresh = dir.replace_directory_entry(0x000, 0x100);
        assert_ne!(fresh, victim);
        assert_eq!(dir.entry(fresh).address(), Some(0x100));
        assert_eq!(dir.entry(fresh).state(), DirectoryState::Uncached);
        assert_eq!(dir.find(0x000), Some(victim));
        assert_eq!(dir.get_directory_entry(0x000), Some(victim));
        assert_eq!(dir.entry(victim).state(), DirectoryState::Shared);

        dir.invalidate_directory_entry(0x000);
        assert_eq!(dir.find(0x000), None);

        // the retired arena slot is recycled by the next replacement
        let again = dir.replace_directory_entry(0x080, 0x000);
        assert_eq!(again, victim);

        let stats = dir.stats();
        assert_eq!(stats.replacements, 2);
        assert_eq!(stats.busiest_set, Some(0));
    }

    #[test]
    #[should_panic(expected = "not being replaced")]
    fn invalidating_a_resident_entry_is_fatal() {
        let mut dir = small();
        dir.get_directory_entry(0x000);
        dir.invalidate_directory_entry(0x000);
    }
}
