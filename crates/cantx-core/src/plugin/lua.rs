//! Lua payload scripts (sandboxed)
//!
//! The script file is evaluated once when loaded. It must define a global
//! function `get_payload(dlc, frame_id)` returning either a byte string or a
//! sequence table of integers in 0..=255. Globals set by the script persist
//! across calls for as long as the plugin stays cached.

use mlua::{Function, Lua, LuaOptions, StdLib, Value, Variadic};
use std::path::{Path, PathBuf};

use super::{PayloadPlugin, PluginError};

fn format_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(v) => v.to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Number(v) => v.to_string(),
        Value::String(v) => v.to_string_lossy().to_string(),
        Value::Table(_) => "<table>".to_string(),
        Value::Function(_) => "<function>".to_string(),
        Value::Thread(_) => "<thread>".to_string(),
        Value::UserData(_) => "<userdata>".to_string(),
        Value::LightUserData(_) => "<lightuserdata>".to_string(),
        Value::Error(err) => format!("<error: {}>", err),
        _ => "<other>".to_string(),
    }
}

fn type_name(value: &Value) -> String {
    value.type_name().to_string()
}

/// A Lua script loaded from disk
pub struct LuaPayloadScript {
    path: PathBuf,
    lua: Lua,
}

impl std::fmt::Debug for LuaPayloadScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaPayloadScript")
            .field("path", &self.path)
            .finish()
    }
}

impl LuaPayloadScript {
    /// Read and evaluate a script file
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let source = std::fs::read_to_string(path).map_err(|e| PluginError::LoadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_source(path, &source)
    }

    /// Evaluate script text; `path` names the script in logs and errors
    pub fn from_source(path: &Path, source: &str) -> Result<Self, PluginError> {
        let load_failed = |message: String| PluginError::LoadFailed {
            path: path.display().to_string(),
            message,
        };

        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::new().catch_rust_panics(true),
        )
        .map_err(|e| load_failed(format!("Failed to initialize Lua: {e}")))?;

        let script = path.display().to_string();
        let print_fn = lua
            .create_function(move |_, args: Variadic<Value>| {
                let line = args
                    .iter()
                    .map(format_value)
                    .collect::<Vec<_>>()
                    .join("\t");
                tracing::debug!(script = %script, "{}", line);
                Ok(())
            })
            .map_err(|e| load_failed(format!("Failed to create print function: {e}")))?;
        lua.globals()
            .set("print", print_fn)
            .map_err(|e| load_failed(format!("Failed to set globals: {e}")))?;

        lua.load(source)
            .set_name(format!("@{}", path.display()))
            .exec()
            .map_err(|e| load_failed(format!("Lua error: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            lua,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_point(&self) -> Result<Function, PluginError> {
        match self.lua.globals().get::<Value>("get_payload") {
            Ok(Value::Function(f)) => Ok(f),
            _ => Err(PluginError::MissingEntryPoint),
        }
    }
}

fn to_bytes(value: Value) -> Result<Vec<u8>, PluginError> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Table(t) => {
            let mut bytes = Vec::new();
            for (i, item) in t.sequence_values::<Value>().enumerate() {
                let item = item.map_err(|e| PluginError::Runtime(e.to_string()))?;
                let n = match item {
                    Value::Integer(n) => n,
                    Value::Number(f) if f.fract() == 0.0 => f as i64,
                    other => {
                        return Err(PluginError::WrongReturnType(format!(
                            "a table containing {}",
                            type_name(&other)
                        )))
                    }
                };
                let byte = u8::try_from(n).map_err(|_| PluginError::InvalidByte(n, i + 1))?;
                bytes.push(byte);
            }
            Ok(bytes)
        }
        other => Err(PluginError::WrongReturnType(type_name(&other))),
    }
}

impl PayloadPlugin for LuaPayloadScript {
    fn generate(&mut self, dlc: u8, frame_id: Option<u32>) -> Result<Vec<u8>, PluginError> {
        let func = self.entry_point()?;
        let id = match frame_id {
            Some(id) => Value::Integer(id as i64),
            None => Value::Nil,
        };
        let result = func
            .call::<Value>((dlc as i64, id))
            .map_err(|e| PluginError::Runtime(e.to_string()))?;
        to_bytes(result)
    }
}
