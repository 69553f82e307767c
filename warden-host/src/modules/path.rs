use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR};

use crate::value::{string_arg, HostResult, NativeObject, Value};

/// Resolve `.` and `..` without touching the filesystem
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => components.push(component),
            },
            _ => components.push(component),
        }
    }
    if components.is_empty() {
        return PathBuf::from(".");
    }
    components.iter().collect()
}

fn display(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn join(args: &[Value]) -> HostResult {
    let mut joined = PathBuf::new();
    for i in 0..args.len() {
        let part = string_arg(args, i, "path.join")?;
        if i == 0 {
            joined.push(part);
        } else {
            // later segments never reset the root
            joined.push(part.trim_start_matches(['/', '\\']));
        }
    }
    Ok(display(&normalize_lexically(&joined)))
}

fn basename(args: &[Value]) -> HostResult {
    let path = Path::new(string_arg(args, 0, "path.basename")?);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let trimmed = match args.get(1).and_then(Value::as_str) {
        Some(ext) if name.len() > ext.len() => name.strip_suffix(ext).unwrap_or(&name).to_string(),
        _ => name,
    };
    Ok(Value::String(trimmed))
}

fn dirname(args: &[Value]) -> HostResult {
    let path = Path::new(string_arg(args, 0, "path.dirname")?);
    Ok(match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => display(parent),
        Some(_) => Value::from("."),
        None => display(path),
    })
}

fn extname(args: &[Value]) -> HostResult {
    let path = Path::new(string_arg(args, 0, "path.extname")?);
    Ok(Value::String(
        path.extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default(),
    ))
}

pub(super) fn module() -> Value {
    NativeObject::new("Path")
        .function("join", join)
        .function("basename", basename)
        .function("dirname", dirname)
        .function("extname", extname)
        .function("normalize", |args| {
            Ok(display(&normalize_lexically(Path::new(string_arg(
                args,
                0,
                "path.normalize",
            )?))))
        })
        .function("isAbsolute", |args| {
            Ok(Value::Bool(
                Path::new(string_arg(args, 0, "path.isAbsolute")?).is_absolute(),
            ))
        })
        .frozen("sep", MAIN_SEPARATOR_STR)
        .frozen("delimiter", if cfg!(windows) { ";" } else { ":" })
        .sealed()
        .build()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        let module = module();
        let f = module.as_object().unwrap().get(name);
        f.as_object().unwrap().call(&Value::Undefined, args).unwrap()
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(normalize_lexically(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize_lexically(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(normalize_lexically(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize_lexically(Path::new("./")), PathBuf::from("."));
    }

    #[cfg(unix)]
    #[test]
    fn test_path_functions() {
        let joined = call("join", &["/srv".into(), "app".into(), "../data".into(), "x.json".into()]);
        assert_eq!(joined.as_str(), Some("/srv/data/x.json"));

        assert_eq!(call("basename", &["/a/b.txt".into()]).as_str(), Some("b.txt"));
        assert_eq!(call("basename", &["/a/b.txt".into(), ".txt".into()]).as_str(), Some("b"));
        assert_eq!(call("dirname", &["/a/b.txt".into()]).as_str(), Some("/a"));
        assert_eq!(call("dirname", &["b.txt".into()]).as_str(), Some("."));
        assert_eq!(call("extname", &["a/b.tar.gz".into()]).as_str(), Some(".gz"));
        assert_eq!(call("extname", &["Makefile".into()]).as_str(), Some(""));
    }

    #[test]
    fn test_separator_is_frozen() {
        let module = module();
        let prop = module
            .as_object()
            .unwrap()
            .get_own_property(&"sep".into())
            .unwrap();
        assert!(prop.is_frozen());
    }
}
