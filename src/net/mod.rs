pub mod buffer;
pub mod ports;
pub mod tcp;

pub use buffer::{BufferPool, PooledBuf};
pub use ports::PortManager;
