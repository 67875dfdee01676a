mod key;
mod storage;

pub use key::HostKey;
pub use storage::{HostLimiterHandle, HostLimiterStorage};
