use std::path::PathBuf;

use clap::Args;

use gridchain::config::PipelineConfig;
use gridchain::context::RunContext;
use gridchain::job::{Group, ModelType, ScoreType, Shard, SubTask, SubTaskArgs};
use gridchain::orchestrator::{self, RunOutput, RunRequest};
use gridchain::Error;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct RunArgs {
    /// Experiment configuration file (JSON)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Recompute outputs that already exist
    #[arg(long)]
    pub force: bool,

    /// Print what would be submitted without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Execute a single job in place instead of the whole graph
    #[arg(long, value_name = "NAME")]
    pub sub_task: Option<String>,

    /// Training iteration of the sub-task
    #[arg(long)]
    pub iteration: Option<u32>,

    /// Shard of the sub-task as <index>/<count>
    #[arg(long, value_name = "I/K")]
    pub shard: Option<String>,

    /// Group of the sub-task (dev, eval)
    #[arg(long)]
    pub group: Option<String>,

    /// Model type of an enroll sub-task (N, T)
    #[arg(long)]
    pub model_type: Option<String>,

    /// Score type of a compute-scores sub-task (A, B, C, D, Z)
    #[arg(long)]
    pub score_type: Option<String>,
}

pub fn run(args: RunArgs, _global: &GlobalArgs) -> CmdResult<RunOutput> {
    let mut config = PipelineConfig::load(&args.config)?;
    config.force |= args.force;
    config.dry_run |= args.dry_run;

    let sub_task = sub_task_from_args(&args)?;
    let config_path = std::fs::canonicalize(&args.config).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("resolve {}", args.config.display())))
    })?;

    let ctx = RunContext::from_config(config, Some(config_path));
    let output = orchestrator::run(&ctx, &RunRequest { sub_task })?;

    let exit_code = match &output {
        RunOutput::Graph(report) => report
            .failure_code()
            .map(crate::output::exit_code_for_error)
            .unwrap_or(0),
        RunOutput::SubTask(_) => 0,
    };

    Ok((output, exit_code))
}

fn sub_task_from_args(args: &RunArgs) -> gridchain::Result<Option<SubTask>> {
    let Some(name) = &args.sub_task else {
        return Ok(None);
    };

    let selector = SubTaskArgs {
        name: name.clone(),
        iteration: args.iteration,
        shard: args.shard.as_deref().map(Shard::parse).transpose()?,
        group: args.group.as_deref().map(Group::parse).transpose()?,
        model_type: args.model_type.as_deref().map(ModelType::parse).transpose()?,
        score_type: args.score_type.as_deref().map(ScoreType::parse).transpose()?,
    };
    SubTask::from_args(&selector).map(Some)
}
