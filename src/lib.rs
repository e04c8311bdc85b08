// STeaMi mesh - advertising-only BLE relay protocol

pub mod ble;
pub mod codec;
pub mod config;
pub mod hal;
pub mod mesh;

pub use codec::{Codec, CodecError, Message, Packet, PayloadFormat, ScalarWidth};
pub use config::{ConfigError, NodeConfig, Preset};
pub use mesh::{MeshNode, NodeHandle, NodeReport, NodeRole, Peripherals};
