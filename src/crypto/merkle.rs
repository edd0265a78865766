//! Merkle root over transaction ids
//!
//! Nodes are hex strings. A leaf is `hex(sha256d(tx_id))` over the id's ASCII
//! bytes; a parent is `hex(sha256d(left ‖ right))` over the concatenated hex
//! strings. Levels are paired left to right and an odd node is paired with
//! itself, including a lone leaf, so every tree has at least one parent level.

use super::hash::double_sha256_hex;
use crate::core::Transaction;

/// Merkle root of arbitrary leaf strings
pub fn calculate_merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return double_sha256_hex(b"");
    }

    let mut level: Vec<String> = leaves
        .iter()
        .map(|leaf| double_sha256_hex(leaf.as_bytes()))
        .collect();

    loop {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                double_sha256_hex(format!("{left}{right}").as_bytes())
            })
            .collect();
        if level.len() == 1 {
            break;
        }
    }

    level.remove(0)
}

/// Merkle root of a block's transactions
pub fn merkle_root_of_txs(txs: &[Transaction]) -> String {
    let ids: Vec<String> = txs.iter().map(|tx| tx.id().to_string()).collect();
    calculate_merkle_root(&ids)
}
