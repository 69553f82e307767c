//! Real `process` module
//!
//! Unlike the sandbox's `process` global this exposes the whole environment,
//! which is why it is classified.

use super::os::{arch, platform};
use crate::value::{NativeObject, Value};

fn environment() -> Value {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();
    let mut env = NativeObject::new("Object");
    for (key, value) in vars {
        env = env.value(key.as_str(), value);
    }
    env.sealed().build().into()
}

pub(super) fn module() -> Value {
    let argv: Vec<Value> = std::env::args().map(Value::String).collect();
    let started = std::time::Instant::now();

    NativeObject::new("Process")
        .frozen("pid", std::process::id() as f64)
        .frozen("platform", platform())
        .frozen("arch", arch())
        .value("argv", argv)
        .value("env", environment())
        .function("cwd", |_| {
            Ok(Value::String(
                std::env::current_dir()?.to_string_lossy().into_owned(),
            ))
        })
        .function("uptime", move |_| Ok(Value::Number(started.elapsed().as_secs_f64())))
        .sealed()
        .build()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exposes_pid_and_cwd() {
        let process = module();
        let process = process.as_object().unwrap();
        assert_eq!(process.get("pid").as_f64(), Some(std::process::id() as f64));

        let cwd = process.get("cwd");
        let cwd = cwd.as_object().unwrap().call(&Value::Undefined, &[]).unwrap();
        assert!(!cwd.as_str().unwrap().is_empty());
    }
}
