use super::traits::*;
use crate::{models::*, StageId};
use arrayref::array_ref;
use std::fmt::Display;

#[macro_export]
macro_rules! decl_table {
    ($name:ident => $key:ty => $value:ty) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl $crate::kv::traits::Table for $name {
            type Key = $key;
            type Value = $value;

            fn db_name(&self) -> &'static str {
                Self::const_db_name()
            }
        }

        impl $name {
            pub const fn const_db_name() -> &'static str {
                stringify!($name)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", Self::const_db_name())
            }
        }
    };
}

#[derive(Clone, Debug)]
pub struct InvalidLength<const EXPECTED: usize> {
    pub got: usize,
}

impl<const EXPECTED: usize> Display for InvalidLength<EXPECTED> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid length: {} != {}", EXPECTED, self.got)
    }
}

impl<const EXPECTED: usize> std::error::Error for InvalidLength<EXPECTED> {}

macro_rules! u64_table_object {
    ($ty:ident) => {
        impl TableEncode for $ty {
            type Encoded = [u8; 8];

            fn encode(self) -> Self::Encoded {
                self.to_be_bytes()
            }
        }

        impl TableDecode for $ty {
            fn decode(b: &[u8]) -> anyhow::Result<Self> {
                match b.len() {
                    8 => Ok(u64::from_be_bytes(*array_ref!(b, 0, 8)).into()),
                    other => Err(InvalidLength::<8> { got: other }.into()),
                }
            }
        }
    };
}

u64_table_object!(BlockNumber);

impl TableEncode for H256 {
    type Encoded = [u8; KECCAK_LENGTH];

    fn encode(self) -> Self::Encoded {
        self.0
    }
}

impl TableDecode for H256 {
    fn decode(b: &[u8]) -> anyhow::Result<Self> {
        match b.len() {
            KECCAK_LENGTH => Ok(H256(*array_ref!(b, 0, KECCAK_LENGTH))),
            other => Err(InvalidLength::<KECCAK_LENGTH> { got: other }.into()),
        }
    }
}

impl TableEncode for StageId {
    type Encoded = &'static [u8];

    fn encode(self) -> Self::Encoded {
        self.0.as_bytes()
    }
}

/// Durable form of a pending unwind: target height followed by the hash of the block at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnwindRecord {
    pub unwind_point: BlockNumber,
    pub unwind_hash: H256,
}

const UNWIND_RECORD_LENGTH: usize = BLOCK_NUMBER_LENGTH + KECCAK_LENGTH;

impl TableEncode for UnwindRecord {
    type Encoded = [u8; UNWIND_RECORD_LENGTH];

    fn encode(self) -> Self::Encoded {
        let mut out = [0; UNWIND_RECORD_LENGTH];
        out[..BLOCK_NUMBER_LENGTH].copy_from_slice(&self.unwind_point.encode());
        out[BLOCK_NUMBER_LENGTH..].copy_from_slice(&self.unwind_hash.encode());
        out
    }
}

impl TableDecode for UnwindRecord {
    fn decode(b: &[u8]) -> anyhow::Result<Self> {
        if b.len() != UNWIND_RECORD_LENGTH {
            return Err(InvalidLength::<UNWIND_RECORD_LENGTH> { got: b.len() }.into());
        }

        Ok(Self {
            unwind_point: BlockNumber::decode(&b[..BLOCK_NUMBER_LENGTH])?,
            unwind_hash: H256::decode(&b[BLOCK_NUMBER_LENGTH..])?,
        })
    }
}

decl_table!(SyncStageProgress => StageId => BlockNumber);
decl_table!(SyncStageUnwind => StageId => UnwindRecord);
decl_table!(CanonicalHeader => BlockNumber => H256);

pub const CHAINDATA_TABLES: &[&str] = &[
    SyncStageProgress::const_db_name(),
    SyncStageUnwind::const_db_name(),
    CanonicalHeader::const_db_name(),
];
