//! Minimal front-end: `quarry <goal> [dir]`.
//!
//! Goals: `list` prints the targets defined in a directory, `check` runs
//! every target's `check_command`, `deploy` runs every `deploy_command`.

use std::path::Path;

use quarry_cfg::ConfigSet;
use quarry_engine::goals::{Check, CheckResult, CheckResults, Deploy, DeployResult, DeployResults};
use quarry_engine::scheduler::Context;
use quarry_engine::{defs, intrinsics, register_configs};
use quarry_engine::{Engine, Param, Params, Registry, RuleDef, Target, UnionMember};
use quarry_ore::hash::Xxh3Hasher;
use quarry_process::{CacheScope, FallibleProcessResult, ProcessRequest};
use tracing_subscriber::EnvFilter;

/// Request to run a target's `check_command` through the shell.
#[derive(Debug)]
struct CommandCheckRequest {
    target: Target,
    command: String,
}

impl Param for CommandCheckRequest {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        self.target.fingerprint(hasher);
        hasher.update(self.command.as_bytes());
    }
}

/// Request to run a target's `deploy_command` through the shell.
#[derive(Debug)]
struct CommandDeployRequest {
    target: Target,
    command: String,
}

impl Param for CommandDeployRequest {
    fn param_fingerprint(&self, hasher: &mut Xxh3Hasher) {
        self.target.fingerprint(hasher);
        hasher.update(self.command.as_bytes());
    }
}

fn registry() -> Result<Registry, quarry_engine::GraphError> {
    let mut builder = Registry::builder();
    intrinsics::register(&mut builder);
    builder
        .rule(
            RuleDef::new("run_check_command", |ctx: Context| async move {
                let request = ctx.param::<CommandCheckRequest>()?;
                let process = ProcessRequest::new(
                    ["/bin/sh", "-c", request.command.as_str()],
                    ctx.store().empty_digest(),
                )
                .with_description(format!("check {}", request.target.address()));
                let result = ctx
                    .get_with::<FallibleProcessResult, ProcessRequest>(process)
                    .await?;
                CheckResult::from_fallible(
                    request.target.address().clone(),
                    "check_command",
                    &result,
                    ctx.store(),
                )
            })
            .param::<CommandCheckRequest>()
            .dep::<FallibleProcessResult>(),
        )
        .rule(
            RuleDef::new("run_deploy_command", |ctx: Context| async move {
                let request = ctx.param::<CommandDeployRequest>()?;
                let process = ProcessRequest::new(
                    ["/bin/sh", "-c", request.command.as_str()],
                    ctx.store().empty_digest(),
                )
                .with_cache_scope(CacheScope::PerRestartSuccessful)
                .with_description(format!("deploy {}", request.target.address()));
                let result = ctx
                    .get_with::<FallibleProcessResult, ProcessRequest>(process)
                    .await?;
                DeployResult::from_fallible(
                    request.target.address().clone(),
                    "deploy_command",
                    &result,
                    ctx.store(),
                )
            })
            .param::<CommandDeployRequest>()
            .dep::<FallibleProcessResult>(),
        )
        .union_member::<Check>(UnionMember::new(
            "check_command",
            &["check_command"],
            Some("skip_check"),
            |target: &Target, fields| CommandCheckRequest {
                target: target.clone(),
                command: fields.string("check_command").unwrap_or_default().to_string(),
            },
        ))
        .union_member::<Deploy>(UnionMember::new(
            "deploy_command",
            &["deploy_command"],
            Some("skip_deploy"),
            |target: &Target, fields| CommandDeployRequest {
                target: target.clone(),
                command: fields.string("deploy_command").unwrap_or_default().to_string(),
            },
        ));
    builder.build()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let goal = args.next().unwrap_or_else(|| "check".to_string());
    let dir = args.next().unwrap_or_else(|| ".".to_string());

    let mut configs = ConfigSet::builder();
    register_configs(&mut configs);
    let configs = configs.build();

    let engine = Engine::new(registry()?, configs);
    let targets = defs::load_defs(Path::new(&dir), engine.configs())?;
    let session = engine.session();

    match goal.as_str() {
        "list" => {
            for target in &targets {
                println!("{} ({})", target.address(), target.kind());
            }
        }
        "check" => {
            let results = session
                .query_union::<CheckResult, Check>(Params::new(), &targets)
                .await?;
            let results: CheckResults = results.iter().map(|result| (**result).clone()).collect();
            if results.skipped() {
                println!("nothing to check");
            } else {
                print!("{results}");
            }
            if !results.success() {
                std::process::exit(1);
            }
        }
        "deploy" => {
            let results = session
                .query_union::<DeployResult, Deploy>(Params::new(), &targets)
                .await?;
            let results: DeployResults = results.iter().map(|result| (**result).clone()).collect();
            if results.skipped() {
                println!("nothing to deploy");
            } else {
                print!("{results}");
            }
            if !results.success() {
                std::process::exit(1);
            }
        }
        other => anyhow::bail!("unknown goal '{other}', expected list, check, or deploy"),
    }

    Ok(())
}
