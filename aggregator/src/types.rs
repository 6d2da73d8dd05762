// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Wire types of the operator-facing RPC.

use eigensdk::crypto_bls::Signature;
use serde::{Deserialize, Serialize};

/// A signed attestation for one batch, as submitted by an operator.
///
/// `operator_id` is the hash of the operator's BLS public key and must match
/// an operator registered in the aggregation service's quorum. The signed
/// payload is the batch identifier hash itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedTaskResponse {
    #[serde(with = "hex::serde")]
    pub batch_merkle_root: [u8; 32],
    #[serde(with = "hex::serde")]
    pub sender_address: [u8; 20],
    #[serde(with = "hex::serde")]
    pub batch_identifier_hash: [u8; 32],
    pub bls_signature: Signature,
    #[serde(with = "hex::serde")]
    pub operator_id: [u8; 32],
}

/// Reply codes of `process_operator_signed_task_response`.
pub const REPLY_SIGNATURE_ACCEPTED: u8 = 0;
pub const REPLY_SIGNATURE_LOST: u8 = 1;

/// A throwaway BLS signature for tests.
#[cfg(test)]
pub(crate) fn test_signature() -> Signature {
    let key_pair = eigensdk::crypto_bls::BlsKeyPair::new("1".to_string())
        .expect("valid test key");
    key_pair.sign_message([3u8; 32].as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_task_response_round_trips_as_json() {
        let response = SignedTaskResponse {
            batch_merkle_root: [1u8; 32],
            sender_address: [2u8; 20],
            batch_identifier_hash: [3u8; 32],
            bls_signature: crate::types::test_signature(),
            operator_id: [4u8; 32],
        };
        let encoded = serde_json::to_string(&response).unwrap();
        let decoded: SignedTaskResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.batch_merkle_root, response.batch_merkle_root);
        assert_eq!(decoded.sender_address, response.sender_address);
        assert_eq!(decoded.operator_id, response.operator_id);
    }
}
