pub mod bitmap;
pub mod boundary;
pub mod byte_key;
pub mod data_gen;
pub mod diva;
pub mod error;
pub mod infix_store;
pub mod interval;

pub use bitmap::{clear_bit, get_bit, rank, select64, set_bit};
pub use boundary::{BoundaryIndex, ByteKeyIndex, IntKeyIndex};
pub use byte_key::ByteKey;
pub use diva::{Diva, DivaFilter, DivaInt};
pub use error::FilterError;
pub use infix_store::{InfixStore, Scales};

pub type Key = u64;
pub const U64_BITS: usize = 64;
