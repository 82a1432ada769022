pub type CmdResult<T> = gridchain::Result<(T, i32)>;

pub(crate) struct GlobalArgs {}

pub mod partition;
pub mod plan;
pub mod run;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run_json($args))
    };
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (gridchain::Result<serde_json::Value>, i32) {
    match command {
        // Commands without global context
        crate::Commands::Partition(args) => dispatch!(args, partition),
        crate::Commands::Plan(args) => dispatch!(args, plan),

        // Commands with global context
        crate::Commands::Run(args) => dispatch!(args, global, run),
    }
}
