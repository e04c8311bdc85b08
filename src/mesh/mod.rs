//! Advertising-only mesh
//!
//! Dedup memory, peer table, addressing, the relay engine and the channel
//! scheduler, plus `MeshNode` which wires them to a radio and peripherals.

pub mod addressing;
pub mod node;
pub mod peers;
pub mod relay;
pub mod scheduler;
pub mod seen;
pub mod summary;

pub use addressing::{Addressing, Bucketing, PresenceBucket};
pub use node::{MeshNode, NodeHandle, NodeReport, Peripherals};
pub use peers::{PeerSnapshot, PeerTable};
pub use relay::{Delivery, Disposition, IgnoreReason, NodeRole, RelayEngine, RelaySettings};
pub use scheduler::{ChannelScheduler, CycleHandler, CycleOrder, CycleStats, SchedulerConfig};
pub use seen::{IdentityPolicy, SeenSet};
