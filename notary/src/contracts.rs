//! ABI of the sharding manager contract.

use alloy::sol;

sol! {
    /// The sharding manager contract on the main chain. It keeps the notary pool, samples notary committees per
    /// shard and period, and records collation headers and votes.
    #[sol(rpc)]
    #[derive(Debug)]
    interface ShardingManager {
        function notaryRegistry(address notary) external view returns (uint256 deregisteredPeriod, uint256 poolIndex, uint256 balance, bool deposited);

        /// Joins the notary pool. The deposit is the value sent with the call.
        function registerNotary() external payable;

        /// Shards whose committee `notary` is a member of in `period`.
        function sampledShards(uint256 period, address notary) external view returns (uint256[] shardIds);

        function submitVote(uint256 shardId, uint256 period, bytes32 chunkRoot) external;

        function hasVoted(uint256 shardId, uint256 period, address notary) external view returns (bool voted);

        function collationRecords(uint256 shardId, uint256 period) external view returns (bytes32 chunkRoot, address proposer, bool isElected, bytes32 signature);
    }
}
