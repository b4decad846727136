pub mod fsproxy_host;
pub mod instance;
pub mod monitor;
pub mod pool;
pub mod rootfs;
pub mod snapshot;
pub mod uffd;

pub use instance::{reap_stale_instances, restore_and_exec, InstanceHandle};
pub use monitor::{BootConfig, FirecrackerMonitor, Monitor};
pub use pool::{PoolConfig, PoolDaemon, Slot, SlotFactory};
pub use rootfs::{ExternalRootfsBuilder, RootfsBuilder};
pub use snapshot::{clean, prepare, status, SnapshotStatus};
pub use uffd::Region;
