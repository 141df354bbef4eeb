use super::{Address, TileId};

/// Maps a block to the tile whose directory and DRAM controller own it.  Blocks are interleaved
/// across controllers, and the controllers are spread evenly over the tiles.
#[derive(Debug, Clone)]
pub struct AddressHomeLookup {
    log_block_size: u32,
    homes: Vec<TileId>,
}

impl AddressHomeLookup {
    pub fn new(block_size: usize, num_controllers: usize, num_tiles: usize) -> Self {
        assert!(block_size.is_power_of_two());
        assert!(
            num_controllers > 0 && num_controllers <= num_tiles,
            "{} dram controllers on {} tiles",
            num_controllers,
            num_tiles
        );
        Self {
            log_block_size: block_size.trailing_zeros(),
            homes: (0..num_controllers).map(|i| i * num_tiles / num_controllers).collect(),
        }
    }

    pub fn home(&self, address: Address) -> TileId {
        let block = (address >> self.log_block_size) as usize;
        self.homes[block % self.homes.len()]
    }

    pub fn controller_tiles(&self) -> &[TileId] {
        &self.homes
    }

    pub fn is_home(&self, tile: TileId) -> bool {
        self.homes.contains(&tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controllers_are_spread_and_interleaved() {
        let homes = AddressHomeLookup::new(64, 4, 16);
        assert_eq!(homes.controller_tiles(), &[0, 4, 8, 12]);
        assert_eq!(homes.home(0x00), 0);
        assert_eq!(homes.home(0x3F), 0);
        assert_eq!(homes.home(0x40), 4);
        assert_eq!(homes.home(0xC0), 12);
        assert_eq!(homes.home(0x100), 0);
        assert!(homes.is_home(8) && !homes.is_home(9));
    }

    #[test]
    fn single_controller_lives_on_tile_zero() {
        let homes = AddressHomeLookup::new(32, 1, 3);
        assert_eq!(homes.home(0xdead_beef), 0);
    }
}
