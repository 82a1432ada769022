//! Remote backend: one batch-engine submission per job.
//!
//! Each submitted job re-invokes this binary with `--sub-task ...` so the
//! engine node runs exactly that job through the dispatcher.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;

use super::ExecutionBackend;
use crate::config::SubmitConfig;
use crate::context::RunContext;
use crate::error::{Error, Result, SubmissionRejectedDetails};
use crate::job::{Handle, Job, ResourceProfile};
use crate::utils::command;
use crate::utils::shell;
use crate::utils::template::{self, TemplateVars};

/// What the batch engine is asked to run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub name: String,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Handle>,
    pub resource: ResourceProfile,
    pub shard_count: usize,
}

pub trait BatchEngine: Send {
    fn submit(&mut self, request: &SubmitRequest) -> Result<Handle>;
}

/// Leading arguments every re-invoked job shares:
/// `<exe> run --config <file> [--force]`.
pub fn reinvocation_args(ctx: &RunContext) -> Result<Vec<String>> {
    let executable = match ctx
        .config
        .grid
        .as_ref()
        .and_then(|grid| grid.submit.as_ref())
        .and_then(|submit| submit.executable.clone())
    {
        Some(exe) => shellexpand::tilde(&exe).to_string(),
        None => std::env::current_exe()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string()),
    };

    let config_path = match (&ctx.config_path, ctx.dry_run) {
        (Some(path), _) => path.to_string_lossy().to_string(),
        (None, true) => "<config>".to_string(),
        (None, false) => {
            return Err(Error::validation_missing_argument(vec!["--config".to_string()])
                .with_hint("Submitted jobs re-read the configuration file; run with --config <file>"))
        }
    };

    let mut args = vec![executable, "run".to_string(), "--config".to_string(), config_path];
    if ctx.force {
        args.push("--force".to_string());
    }
    Ok(args)
}

pub struct RemoteBackend {
    engine: Box<dyn BatchEngine>,
    base_args: Vec<String>,
}

impl RemoteBackend {
    pub fn new(engine: Box<dyn BatchEngine>, base_args: Vec<String>) -> Self {
        Self { engine, base_args }
    }

    pub fn request_for(&self, job: &Job, dependencies: &[Handle]) -> SubmitRequest {
        let mut command = self.base_args.clone();
        command.extend(job.task.to_args());
        SubmitRequest {
            name: job.name.clone(),
            command,
            dependencies: dependencies.to_vec(),
            resource: job.resource.clone(),
            shard_count: job.shard_count,
        }
    }
}

impl ExecutionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn is_local(&self) -> bool {
        false
    }

    fn submit(&mut self, job: &Job, dependencies: &[Handle]) -> Result<Handle> {
        let request = self.request_for(job, dependencies);
        self.engine.submit(&request)
    }
}

/// Runs the configured submit command and scrapes the job id from its output.
pub struct CommandEngine {
    template: String,
    /// The template has a slot for the wait-list.
    passes_dependencies: bool,
    handle_pattern: Regex,
    dependency_option: String,
    dependency_separator: String,
}

impl CommandEngine {
    pub fn from_config(config: &SubmitConfig) -> Result<Self> {
        let handle_pattern = Regex::new(&config.handle_pattern).map_err(|e| {
            Error::config_invalid_value(
                "grid.submit.handlePattern",
                Some(config.handle_pattern.clone()),
                e.to_string(),
            )
        })?;

        let passes_dependencies = template::is_present(&config.command, TemplateVars::WAIT_FOR)
            || template::is_present(&config.command, TemplateVars::DEPENDENCIES);

        Ok(Self {
            template: config.command.clone(),
            passes_dependencies,
            handle_pattern,
            dependency_option: config.dependency_option.clone(),
            dependency_separator: config.dependency_separator.clone(),
        })
    }

    pub fn render(&self, request: &SubmitRequest) -> String {
        let dependencies = request
            .dependencies
            .iter()
            .map(Handle::as_str)
            .collect::<Vec<_>>()
            .join(&self.dependency_separator);
        let wait_for = if dependencies.is_empty() {
            String::new()
        } else {
            format!("{} {}", self.dependency_option, dependencies)
        };

        let resource = &request.resource;
        let mut extra = resource.extra_args.clone();
        if resource.io_big {
            extra.push("-l".to_string());
            extra.push("io_big".to_string());
        }

        let vars: HashMap<String, String> = [
            (TemplateVars::NAME, shell::quote_arg(&request.name)),
            (TemplateVars::DEPENDENCIES, dependencies.clone()),
            (TemplateVars::WAIT_FOR, wait_for),
            (TemplateVars::QUEUE, resource.queue.clone().unwrap_or_default()),
            (TemplateVars::MEMORY, resource.memory.clone().unwrap_or_default()),
            (TemplateVars::TIME, resource.time.clone().unwrap_or_default()),
            (TemplateVars::EXTRA, shell::quote_args(&extra)),
            (TemplateVars::COMMAND, shell::quote_args(&request.command)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        template::render_map(&self.template, &vars)
    }
}

impl BatchEngine for CommandEngine {
    fn submit(&mut self, request: &SubmitRequest) -> Result<Handle> {
        if !request.dependencies.is_empty() && !self.passes_dependencies {
            return Err(Error::config_invalid_value(
                "grid.submit.command",
                Some(self.template.clone()),
                format!(
                    "Job '{}' has predecessors but the template has no {{{{waitFor}}}} or {{{{dependencies}}}} slot",
                    request.name
                ),
            ));
        }

        let rendered = self.render(request);
        log_status!("submit", "{}", rendered);

        let output = command::run_shell(&rendered, None, &format!("submit {}", request.name))?;

        let rejected = |exit_code: Option<i32>, output: String| {
            Error::submission_rejected(SubmissionRejectedDetails {
                job: request.name.clone(),
                command: rendered.clone(),
                exit_code,
                output,
            })
        };

        if !output.success {
            return Err(rejected(output.exit_code, output.error_text().to_string()).with_retryable(true));
        }

        let id = self
            .handle_pattern
            .captures(&output.stdout)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                rejected(output.exit_code, output.stdout.clone())
                    .with_hint("The submit output did not match grid.submit.handlePattern")
            })?;

        Ok(Handle::new(id))
    }
}

/// Hands out sequential fake ids and submits nothing.
pub struct DryRunEngine {
    next: u64,
}

impl DryRunEngine {
    pub fn new(first_id: u64) -> Self {
        Self { next: first_id }
    }
}

impl BatchEngine for DryRunEngine {
    fn submit(&mut self, request: &SubmitRequest) -> Result<Handle> {
        let handle = Handle::new(self.next.to_string());
        self.next += 1;

        let waits: Vec<&str> = request.dependencies.iter().map(Handle::as_str).collect();
        log_status!(
            "dry-run",
            "Would submit {} as {} (after [{}]): {}",
            request.name,
            handle,
            waits.join(", "),
            shell::quote_args(&request.command)
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::job::{Shard, SubTask};

    fn submit_config(command: &str) -> SubmitConfig {
        serde_json::from_value(serde_json::json!({ "command": command })).unwrap()
    }

    fn request(deps: &[&str]) -> SubmitRequest {
        SubmitRequest {
            name: "isv-m-step.0".to_string(),
            command: vec!["gridchain".to_string(), "run".to_string()],
            dependencies: deps.iter().map(|d| Handle::new(*d)).collect(),
            resource: ResourceProfile {
                queue: Some("q1d".to_string()),
                memory: Some("8G".to_string()),
                ..Default::default()
            },
            shard_count: 1,
        }
    }

    #[test]
    fn renders_wait_list_and_resources() {
        let engine = CommandEngine::from_config(&submit_config(
            "qsub -N {{name}} {{waitFor}} -q {{queue}} -l mem={{memory}} {{command}}",
        ))
        .unwrap();

        assert_eq!(
            engine.render(&request(&["11", "12"])),
            "qsub -N isv-m-step.0 -hold_jid 11,12 -q q1d -l mem=8G gridchain run"
        );
    }

    #[test]
    fn no_dependencies_leaves_wait_list_empty() {
        let engine = CommandEngine::from_config(&submit_config("qsub{{waitFor}} {{command}}")).unwrap();
        assert_eq!(engine.render(&request(&[])), "qsub gridchain run");
    }

    #[test]
    fn extracts_handle_from_output() {
        let mut engine = CommandEngine::from_config(&submit_config(
            "echo Your job 4711 has been submitted",
        ))
        .unwrap();
        assert_eq!(engine.submit(&request(&[])).unwrap().as_str(), "4711");
    }

    #[test]
    fn rejected_submission_carries_output() {
        let mut engine =
            CommandEngine::from_config(&submit_config("echo queue full >&2; exit 2")).unwrap();
        let err = engine.submit(&request(&[])).unwrap_err();
        assert_eq!(err.code.as_str(), "submission.rejected");
        assert_eq!(err.details["output"], "queue full");
        assert_eq!(err.details["exitCode"], 2);
        assert_eq!(err.retryable, Some(true));
    }

    #[test]
    fn template_without_wait_list_slot_rejects_dependent_job() {
        let mut engine = CommandEngine::from_config(&submit_config("echo 17")).unwrap();
        assert_eq!(engine.submit(&request(&[])).unwrap().as_str(), "17");

        let err = engine.submit(&request(&["16"])).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
    }

    #[test]
    fn unparseable_output_is_rejected() {
        let mut engine = CommandEngine::from_config(&submit_config("echo accepted")).unwrap();
        let err = engine.submit(&request(&[])).unwrap_err();
        assert_eq!(err.code.as_str(), "submission.rejected");
    }

    #[test]
    fn invalid_handle_pattern_is_configuration_error() {
        let mut config = submit_config("qsub");
        config.handle_pattern = "(".to_string();
        let err = CommandEngine::from_config(&config).err().unwrap();
        assert_eq!(err.code.as_str(), "config.invalid_value");
    }

    #[test]
    fn dry_run_ids_are_sequential() {
        let mut engine = DryRunEngine::new(100);
        assert_eq!(engine.submit(&request(&[])).unwrap().as_str(), "100");
        assert_eq!(engine.submit(&request(&["100"])).unwrap().as_str(), "101");
        assert_eq!(engine.submit(&request(&["101"])).unwrap().as_str(), "102");
    }

    #[test]
    fn job_command_reinvokes_sub_task() {
        let mut config = PipelineConfig::new("/tmp/exp");
        config.parallel = Some(2);
        let ctx = RunContext::from_config(config, Some("/tmp/exp/isv.json".into())).with_force(true);
        let backend = RemoteBackend::new(Box::new(DryRunEngine::new(0)), reinvocation_args(&ctx).unwrap());

        let job = Job::new(
            SubTask::IsvEStep {
                iteration: 3,
                shard: Shard::new(1, 4),
            },
            ResourceProfile::default(),
            Vec::new(),
        );
        let request = backend.request_for(&job, &[Handle::new("7")]);

        assert_eq!(
            &request.command[1..],
            &[
                "run",
                "--config",
                "/tmp/exp/isv.json",
                "--force",
                "--sub-task",
                "isv-e-step",
                "--iteration",
                "3",
                "--shard",
                "1/4",
            ]
        );
        assert_eq!(request.dependencies, vec![Handle::new("7")]);
    }

    #[test]
    fn missing_config_path_is_rejected_outside_dry_run() {
        let mut config = PipelineConfig::new("/tmp/exp");
        config.parallel = Some(2);
        let ctx = RunContext::from_config(config, None);
        assert!(reinvocation_args(&ctx).is_err());
        assert!(reinvocation_args(&ctx.with_dry_run(true)).is_ok());
    }
}
