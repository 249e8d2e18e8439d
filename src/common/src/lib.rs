pub mod abi;
pub mod control;
pub mod daemon_proto;
pub mod elf;
pub mod error;
pub mod ext;
pub mod wire;

pub use abi::Abi;
pub use error::InjectError;
