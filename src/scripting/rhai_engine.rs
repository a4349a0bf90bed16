//! Rhai script host.
//!
//! [`ScriptHost`] owns a Rhai `Engine` with the Imaging Machine bindings
//! registered and an operation limit installed. Each execution gets a fresh
//! scope holding `im`, the session handle, so scripts cannot leak state into
//! each other.
//!
//! ```rust,ignore
//! let host = ScriptHost::new(Handle::current(), 100_000);
//! let machine = Arc::new(ImagingMachine::connect(&settings.connection).await?);
//! host.execute(r#"im.set_objective(2);"#, machine).await?;
//! ```

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::bindings::{self, MachineHandle};
use crate::error::{ImError, ImResult};
use crate::machine::ImagingMachine;

/// Name the session handle is bound to inside scripts.
pub const MACHINE_VARIABLE: &str = "im";

/// Rhai engine wired to an Imaging Machine session
pub struct ScriptHost {
    engine: Arc<Engine>,
    runtime: Handle,
}

impl ScriptHost {
    /// Create a host whose scripts drive their I/O on `runtime` and abort
    /// after `max_operations` Rhai operations.
    pub fn new(runtime: Handle, max_operations: u64) -> Self {
        let mut engine = Engine::new();

        engine.on_progress(move |count| {
            if count > max_operations {
                Some(format!("Safety limit exceeded: maximum {max_operations} operations").into())
            } else {
                None
            }
        });
        engine.on_print(|text| info!(target: "im_control::script", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(target: "im_control::script", ?source, %pos, "{text}");
        });

        bindings::register_machine(&mut engine);

        Self {
            engine: Arc::new(engine),
            runtime,
        }
    }

    /// Check that `script` compiles, without running it.
    pub fn validate(&self, script: &str) -> ImResult<()> {
        self.compile(script).map(|_| ())
    }

    fn compile(&self, script: &str) -> ImResult<AST> {
        self.engine
            .compile(script)
            .map_err(|e| ImError::Script(e.to_string()))
    }

    /// Run `script` against `machine` and return its final value.
    ///
    /// Scripts block on every remote call, so they run on the blocking pool.
    pub async fn execute(&self, script: &str, machine: Arc<ImagingMachine>) -> ImResult<Dynamic> {
        let ast = self.compile(script)?;
        let engine = Arc::clone(&self.engine);
        let handle = MachineHandle::new(machine, self.runtime.clone());

        tokio::task::spawn_blocking(move || {
            let mut scope = Scope::new();
            scope.push(MACHINE_VARIABLE, handle);
            engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                .map_err(convert_rhai_error)
        })
        .await
        .map_err(|e| ImError::Script(format!("script task failed: {e}")))?
    }

    /// Read a `.rhai` file and [`execute`](Self::execute) it.
    pub async fn execute_file(
        &self,
        path: &Path,
        machine: Arc<ImagingMachine>,
    ) -> ImResult<Dynamic> {
        let script = tokio::fs::read_to_string(path).await?;
        info!(script = %path.display(), "running script");
        self.execute(&script, machine).await
    }
}

fn convert_rhai_error(error: Box<EvalAltResult>) -> ImError {
    match *error {
        EvalAltResult::ErrorParsing(parse_error, pos) => {
            ImError::Script(format!("{parse_error} at {pos}"))
        }
        EvalAltResult::ErrorRuntime(message, pos) => {
            ImError::Script(format!("{message} at {pos}"))
        }
        other => ImError::Script(other.to_string()),
    }
}
