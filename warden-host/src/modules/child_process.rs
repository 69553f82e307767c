//! `child_process`
//!
//! Programs are spawned directly, never through a shell, so arguments are
//! passed verbatim.

use std::path::PathBuf;
use std::process::{Command, Output};

use super::ModuleContext;
use crate::value::{string_arg, HostError, HostResult, NativeObject, Value};

struct SpawnState {
    cwd: PathBuf,
}

fn string_list(value: Option<&Value>, function: &str) -> HostResult<Vec<String>> {
    match value {
        None | Some(Value::Undefined) | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    HostError::type_error(format!("{}: arguments must be strings", function))
                })
            })
            .collect(),
        Some(_) => Err(HostError::type_error(format!(
            "{}: argument 2 must be an array",
            function
        ))),
    }
}

fn run(owner: &NativeObject, args: &[Value], function: &str) -> HostResult<(String, Output)> {
    let program = string_arg(args, 0, function)?.to_string();
    let argv = string_list(args.get(1), function)?;
    let state = owner
        .state::<SpawnState>()
        .ok_or_else(|| HostError::type_error("child_process object without native state"))?;

    tracing::debug!(program = %program, args = ?argv, "Spawning process");
    let output = Command::new(&program)
        .args(&argv)
        .current_dir(&state.cwd)
        .output()?;
    Ok((program, output))
}

pub(super) fn module(ctx: &ModuleContext) -> Value {
    let state = SpawnState {
        cwd: ctx.resources_dir.clone(),
    };

    NativeObject::with_state("ChildProcess", state)
        .method("execSync", |owner, args| {
            let (program, output) = run(owner, args, "execSync")?;
            if !output.status.success() {
                return Err(HostError::failed(format!(
                    "Command failed: {} ({}): {}",
                    program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            Ok(Value::String(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ))
        })
        .method("spawnSync", |owner, args| {
            let (_, output) = run(owner, args, "spawnSync")?;
            let status = output
                .status
                .code()
                .map(|c| Value::Number(c as f64))
                .unwrap_or(Value::Null);
            Ok(NativeObject::new("SpawnResult")
                .value("status", status)
                .value("stdout", String::from_utf8_lossy(&output.stdout).into_owned())
                .value("stderr", String::from_utf8_lossy(&output.stderr).into_owned())
                .build()
                .into())
        })
        .sealed()
        .build()
        .into()
}
