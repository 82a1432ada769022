use clap::Args;
use serde::Serialize;

use gridchain::partition::{self, ShardRange};

use super::CmdResult;

#[derive(Args)]
pub struct PartitionArgs {
    /// Number of items in the list
    pub total: usize,

    /// Number of shards to split it into
    pub shards: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionOutput {
    pub total: usize,
    pub requested_shards: usize,
    pub ranges: Vec<ShardRange>,
}

pub fn run_json(args: PartitionArgs) -> CmdResult<PartitionOutput> {
    let ranges = partition::describe(args.total, args.shards)?;
    Ok((
        PartitionOutput {
            total: args.total,
            requested_shards: args.shards,
            ranges,
        },
        0,
    ))
}
