//! MOSI directory coherence between per-tile L1/L2 caches and directory-backed DRAM.

pub mod address_home;
pub mod cache;
pub mod cache_state;
pub mod directory_cache;
pub mod directory_entry;
pub mod dram_cntlr;
pub mod dram_directory_cntlr;
pub mod l1_cache_cntlr;
pub mod l2_cache_cntlr;
pub mod memory_manager;
pub mod network;
pub mod req_queue_list;
pub mod shmem_msg;
pub mod stats;
pub mod sync;


pub type TileId = usize;
pub type Address = u64;

pub use cache_state::CacheState;
pub use directory_entry::{DirectoryEntry, DirectoryState};
pub use memory_manager::{AccessSummary, LockSignal, MemOp, MemoryManager};
pub use shmem_msg::{MemComponent, ShmemMsg, ShmemMsgType};
