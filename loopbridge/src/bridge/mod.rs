//! The C ABI boundary with the foreign event loop.

pub mod abi;
pub mod capsule;
#[cfg(feature = "native")]
pub mod native;
