pub mod b64;
pub mod money;

pub use b64::Base64Bytes;
