// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Generated bindings for the on-chain service manager.
//!
//! The `NewBatch` event exists in two ABI versions; V3 added the
//! respond-to-task fee limit. Everything downstream consumes the decoded
//! [`NewBatchLog`](crate::NewBatchLog) form, so the version split stays
//! contained here.

use alloy::sol;

sol! {
    #[sol(rpc)]
    #[derive(Debug)]
    contract BatchServiceManager {
        struct G1Point {
            uint256 X;
            uint256 Y;
        }

        struct G2Point {
            uint256[2] X;
            uint256[2] Y;
        }

        struct NonSignerStakesAndSignature {
            uint32[] nonSignerQuorumBitmapIndices;
            G1Point[] nonSignerPubkeys;
            G1Point[] quorumApks;
            G2Point apkG2;
            G1Point sigma;
            uint32[] quorumApkIndices;
            uint32[] totalStakeIndices;
            uint32[][] nonSignerStakeIndices;
        }

        event NewBatchV2(
            bytes32 indexed batchMerkleRoot,
            address senderAddress,
            uint32 taskCreatedBlock,
            string batchDataPointer
        );

        event NewBatchV3(
            bytes32 indexed batchMerkleRoot,
            address senderAddress,
            uint32 taskCreatedBlock,
            string batchDataPointer,
            uint256 respondToTaskFeeLimit
        );

        function batchesState(bytes32 batchIdentifierHash)
            external
            view
            returns (uint32 taskCreatedBlock, bool responded, uint256 respondToTaskFeeLimit);

        function batchersBalances(address batcher) external view returns (uint256);

        function respondToTaskV2(
            bytes32 batchMerkleRoot,
            address senderAddress,
            NonSignerStakesAndSignature memory nonSignerStakesAndSignature
        ) external;
    }
}
