//! Deterministic identity derivation.
//!
//! Contract addresses and object ids are content-derived so that the same
//! deployment or creation replayed from the same inputs produces the same
//! identity on every node.

use kiln_types::primitives::{Address, Hash, ObjectId};

use crate::hash::blake3_hash_domain_multi;

const CONTRACT_DOMAIN: &str = "kiln.contract.v1";
const OBJECT_DOMAIN: &str = "kiln.object.v1";

/// Derive a contract address from its bytecode and the deploying sender:
/// the first 20 bytes of the domain-separated BLAKE3 hash of both.
pub fn contract_address(code: &[u8], sender: &Address) -> Address {
    let hash = blake3_hash_domain_multi(CONTRACT_DOMAIN, &[code, sender]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[..20]);
    addr
}

/// Derive a fresh object id from the creating contract, the transaction
/// sender, the transaction hash, and a per-invocation creation counter.
/// The counter makes ids unique when one invocation creates several objects.
pub fn object_id(contract: &Address, sender: &Address, tx_hash: &Hash, nonce: u64) -> ObjectId {
    blake3_hash_domain_multi(
        OBJECT_DOMAIN,
        &[contract, sender, tx_hash, &nonce.to_le_bytes()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_contract_address_deterministic() {
        let code = b"\0asm....";
        let sender = [3u8; 20];
        assert_eq!(
            contract_address(code, &sender),
            contract_address(code, &sender)
        );
    }

    #[test]
    fn test_contract_address_depends_on_sender() {
        let code = b"\0asm....";
        assert_ne!(
            contract_address(code, &[1u8; 20]),
            contract_address(code, &[2u8; 20])
        );
    }

    #[test]
    fn test_object_id_nonce_disambiguates() {
        let contract = [1u8; 20];
        let sender = [2u8; 20];
        let tx = [3u8; 32];
        assert_ne!(
            object_id(&contract, &sender, &tx, 0),
            object_id(&contract, &sender, &tx, 1)
        );
    }

    proptest! {
        #[test]
        fn prop_object_ids_unique_across_nonces(a in 0u64..1000, b in 0u64..1000) {
            prop_assume!(a != b);
            let contract = [9u8; 20];
            let sender = [8u8; 20];
            let tx = [7u8; 32];
            prop_assert_ne!(
                object_id(&contract, &sender, &tx, a),
                object_id(&contract, &sender, &tx, b)
            );
        }
    }
}
