pub mod alert;
pub mod blockinfo;
pub mod conf;
pub mod disk;
pub mod error;
pub mod priority;
pub mod storage_info;

mod define;
pub use define::*;

#[cfg(test)]
mod test_util;
