mod header;

pub use self::header::*;

use derive_more::{Deref, DerefMut, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use std::mem::size_of;

pub use ethereum_types::{Address, H256};

pub const KECCAK_LENGTH: usize = H256::len_bytes();
pub const BLOCK_NUMBER_LENGTH: usize = size_of::<u64>();

#[derive(
    Clone,
    Copy,
    Debug,
    Deref,
    DerefMut,
    Default,
    Display,
    PartialEq,
    Eq,
    From,
    FromStr,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Parent height, saturating at genesis.
    pub fn parent(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}
