use std::path::PathBuf;

use crate::value::{NativeObject, Value};

/// Platform name in the form extension code expects
pub(crate) fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

pub(crate) fn arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn path_value(path: Option<PathBuf>) -> Value {
    path.map(|p| Value::String(p.to_string_lossy().into_owned()))
        .unwrap_or(Value::Null)
}

pub(super) fn module() -> Value {
    NativeObject::new("Os")
        .function("platform", |_| Ok(Value::from(platform())))
        .function("arch", |_| Ok(Value::from(arch())))
        .function("type", |_| Ok(Value::from(std::env::consts::OS)))
        .function("hostname", |_| Ok(Value::String(hostname())))
        .function("homedir", |_| Ok(path_value(dirs::home_dir())))
        .function("tmpdir", |_| Ok(path_value(Some(std::env::temp_dir()))))
        .function("cpus", |_| {
            let count = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            Ok(Value::Number(count as f64))
        })
        .frozen("EOL", if cfg!(windows) { "\r\n" } else { "\n" })
        .sealed()
        .build()
        .into()
}
