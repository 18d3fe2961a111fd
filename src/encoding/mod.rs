//! Binary data encodings.
//!
//! - bincode: used for oplog entry size accounting and value encoding.
pub mod bincode;
