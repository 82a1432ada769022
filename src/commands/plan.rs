use std::path::PathBuf;

use clap::Args;

use gridchain::config::PipelineConfig;
use gridchain::orchestrator::{self, GraphPlan};

use super::CmdResult;

#[derive(Args)]
pub struct PlanArgs {
    /// Experiment configuration file (JSON)
    #[arg(long, short = 'c')]
    pub config: PathBuf,
}

pub fn run_json(args: PlanArgs) -> CmdResult<GraphPlan> {
    let config = PipelineConfig::load(&args.config)?;
    let plan = orchestrator::plan(&config)?;
    Ok((plan, 0))
}
