//! `WebAssembly`
//!
//! Validation only: compiling or instantiating nested modules from inside a
//! sandbox is not offered.

use wasmtime::Engine;

use crate::value::{bytes_arg, NativeObject, Value};

pub(super) fn module() -> Value {
    let engine = Engine::default();
    NativeObject::new("WebAssembly")
        .function("validate", move |args| {
            let bytes = bytes_arg(args, 0, "WebAssembly.validate")?;
            Ok(Value::Bool(wasmtime::Module::validate(&engine, &bytes).is_ok()))
        })
        .sealed()
        .build()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let wasm = module();
        let validate = wasm.as_object().unwrap().get("validate");
        let validate = validate.as_object().unwrap();

        // empty module: magic + version
        let empty = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
        assert!(validate.call(&Value::Undefined, &[Value::Bytes(empty)]).unwrap().truthy());
        assert!(!validate
            .call(&Value::Undefined, &[Value::Bytes(vec![1, 2, 3])])
            .unwrap()
            .truthy());
    }
}
