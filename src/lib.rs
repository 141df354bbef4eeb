pub mod base {
    pub mod mem;
}
pub mod memory;
pub mod sim {
    pub mod config;
    pub mod top;
}
pub mod timeq;
