//! Merkle root over the transaction ids of a block

use super::hash::sha256;

/// Calculate the merkle root from a list of leaf hashes
pub fn calculate_merkle_root(hashes: &[Vec<u8>]) -> Option<Vec<u8>> {
    if hashes.is_empty() {
        return None;
    }

    let mut current_level: Vec<Vec<u8>> = hashes.to_vec();

    while current_level.len() > 1 {
        let next_level = current_level
            .chunks(2)
            .map(|chunk| {
                // Duplicate the last hash if odd number
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                let mut data = chunk[0].clone();
                data.extend_from_slice(right);
                sha256(&data)
            })
            .collect();

        current_level = next_level;
    }

    current_level.pop()
}

/// Merkle root of hex transaction ids, hex encoded.
///
/// Ids that are not valid hex are hashed as raw bytes so that a tampered id
/// still changes the root instead of silently disappearing from it.
pub fn merkle_root_of_ids(ids: &[String]) -> Option<String> {
    let leaves: Vec<Vec<u8>> = ids
        .iter()
        .map(|id| hex::decode(id).unwrap_or_else(|_| sha256(id.as_bytes())))
        .collect();
    calculate_merkle_root(&leaves).map(hex::encode)
}
