use serde::Serialize;

/// MOSI state of a private cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CacheState {
    #[default]
    Invalid,
    Shared,
    Owned,
    Modified,
}

impl CacheState {
    pub fn readable(self) -> bool {
        matches!(self, CacheState::Shared | CacheState::Owned | CacheState::Modified)
    }

    pub fn writable(self) -> bool {
        self == CacheState::Modified
    }

    // dirty lines carry data the directory does not have yet
    pub fn dirty(self) -> bool {
        matches!(self, CacheState::Owned | CacheState::Modified)
    }
}

#[cfg(test)]
mod tests {
    use super::CacheState;

    #[test]
    fn permissions() {
        assert!(!CacheState::Invalid.readable());
        assert!(CacheState::Shared.readable() && !CacheState::Shared.writable());
        assert!(CacheState::Owned.readable() && !CacheState::Owned.writable());
        assert!(CacheState::Modified.readable() && CacheState::Modified.writable());
        assert!(CacheState::Owned.dirty() && !CacheState::Shared.dirty());
    }
}
