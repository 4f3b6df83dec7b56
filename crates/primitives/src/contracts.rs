//! Bindings for the rewards contract and the two contracts it pays out
//! through.

use alloy_sol_types::sol;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct G1Point {
        uint256 x;
        uint256 y;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Contributor {
        address addr;
        uint256 stakedAmount;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct SeedServiceNode {
        G1Point pubkey;
        Contributor[] contributors;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct BLSSignatureParams {
        uint256 sigs0;
        uint256 sigs1;
        uint256 sigs2;
        uint256 sigs3;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct ServiceNodeParams {
        uint256 serviceNodePubkey;
        uint256 serviceNodeSignature1;
        uint256 serviceNodeSignature2;
        uint16 fee;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct ServiceNode {
        uint64 next;
        uint64 prev;
        address operator;
        G1Point pubkey;
        uint256 addedTimestamp;
        uint256 leaveRequestTimestamp;
        uint256 deposit;
        Contributor[] contributors;
    }

    #[derive(Debug)]
    interface ServiceNodeRewards {
        function stakingRequirement() external view returns (uint256);
        function totalNodes() external view returns (uint256);
        function serviceNodes(uint64 serviceNodeID) external view returns (ServiceNode memory);
        function recipients(address recipient) external view returns (uint256 rewards, uint256 claimed);
        function seedPublicKeyList(SeedServiceNode[] nodes) external;
        function start() external;
        function addBLSPublicKey(G1Point blsPubkey, BLSSignatureParams blsSignature, ServiceNodeParams serviceNodeParams) external;
        function updateRewardsBalance(address recipientAddress, uint256 recipientRewards, BLSSignatureParams blsSignature, uint64[] ids) external;
        function claimRewards() external;
    }

    #[derive(Debug)]
    interface ERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    #[derive(Debug)]
    interface FoundationPool {
        function payoutReleased() external view returns (uint256);
    }
}
