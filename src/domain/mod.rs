pub mod counter;
pub mod device;
pub mod dispatch;
pub mod global;
pub mod program;
pub mod sample;

pub use counter::*;
pub use device::*;
pub use dispatch::*;
pub use global::*;
pub use program::*;
pub use sample::*;
