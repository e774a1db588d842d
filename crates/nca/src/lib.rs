//! Decoding of Nintendo Switch content archives (NCAs).
//!
//! [`formats::nca::Nca`] decrypts the headers of an NCA and opens its sections as
//! [`storage::ReadableStorage`]s that decrypt and verify the data while it's read.

pub use binrw;

pub mod crypto;
pub mod formats;
mod hexstring;
pub mod ids;
pub mod storage;
