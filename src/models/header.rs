use super::*;
use serde::{Deserialize, Serialize};

/// Header fields the sync pipeline looks at while batching downloads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub beneficiary: Address,
    pub state_root: H256,
    pub number: BlockNumber,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
}

/// Orders a header batch by height before it is handed to a stage.
///
/// The sort is stable: headers sharing a height keep their relative order, and no field other
/// than the position in the slice changes.
pub fn sort_headers_asc(headers: &mut [BlockHeader]) {
    headers.sort_by_key(|header| header.number);
}
