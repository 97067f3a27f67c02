pub mod catalog;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod gate;
pub mod index;
pub mod io;
pub mod metadata;
pub mod progress;
pub mod sync;
pub mod walker;

pub use crate::config::SyncConfig;
pub use context::Context;
pub use device::{Device, DeviceList, BLOCK_SIZE};
pub use error::Error;
pub use index::{DestFile, File, FileIndex, FileType};
pub use progress::{FileProgress, MountPrompt, OverallProgress, ProgressStream};
pub use sync::{SyncOptions, SyncSession};
