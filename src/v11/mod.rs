//! ETP 1.1: message shapes, the version adapter and protocol handlers.

mod adapter;
pub mod core;
pub mod datatypes;
pub mod store;

pub use self::adapter::Etp11Adapter;
pub use self::core::{CoreClientHandler, CoreServerHandler};

/// Protocol numbers handled by this module.
pub mod protocols {
    pub const CORE: i32 = 0;
    pub const STORE: i32 = 4;
}
