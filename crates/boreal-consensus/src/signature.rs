//! Commit payload construction. This layout is authoritative for both
//! signing and verifying COMMIT ballots and COMMITTED aggregates.

use alloy_primitives::B256;
use boreal_primitives::{BlockNumber, ViewId};

/// `LE-u64(number) ‖ hash ‖ LE-u64(view)` once staking is active at the
/// block's epoch; pre-staking payloads omit the view suffix, so commits
/// from before the fork stay verifiable.
pub fn construct_commit_payload(
    staking: bool,
    block_num: BlockNumber,
    block_hash: &B256,
    view_id: ViewId,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(48);
    payload.extend_from_slice(&block_num.to_le_bytes());
    payload.extend_from_slice(block_hash.as_slice());
    if staking {
        payload.extend_from_slice(&view_id.to_le_bytes());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_staking_layout() {
        let hash = B256::repeat_byte(0xcd);
        let payload = construct_commit_payload(true, 7, &hash, 3);

        assert_eq!(payload.len(), 48);
        assert_eq!(&payload[..8], &7u64.to_le_bytes());
        assert_eq!(&payload[8..40], hash.as_slice());
        assert_eq!(&payload[40..], &3u64.to_le_bytes());
    }

    #[test]
    fn pre_staking_omits_view_id() {
        let hash = B256::repeat_byte(0xcd);
        let payload = construct_commit_payload(false, 7, &hash, 3);

        assert_eq!(payload.len(), 40);
        assert_eq!(&payload[..8], &7u64.to_le_bytes());
        assert_eq!(&payload[8..], hash.as_slice());
    }

    #[test]
    fn view_id_changes_post_staking_payload_only() {
        let hash = B256::repeat_byte(0x01);
        assert_ne!(
            construct_commit_payload(true, 1, &hash, 0),
            construct_commit_payload(true, 1, &hash, 1),
        );
        assert_eq!(
            construct_commit_payload(false, 1, &hash, 0),
            construct_commit_payload(false, 1, &hash, 1),
        );
    }
}
