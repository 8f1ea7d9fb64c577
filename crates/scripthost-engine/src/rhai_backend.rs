//! Rhai backend implementation

use crate::backend::{ScriptBackend, Variables};
use crate::context::{CheckpointKind, ExecutionRuntime, FrameScope};
use parking_lot::RwLock;
use rhai::debugger::{DebuggerCommand, DebuggerEvent};
use rhai::{
    Array, Blob, Dynamic, Engine, EvalAltResult, Map, Module, ModuleResolver, Position, Scope,
    Shared, AST, INT,
};
use scripthost_core::{
    EngineConfig, Inspect, Member, Result, ScriptError, ScriptHandle, ScriptLanguage,
    ScriptSource, Value, ValueInspector,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

type MemberFn = Arc<dyn Fn(&Dynamic) -> Option<Result<Vec<Member>>> + Send + Sync>;
type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Enumerates members of Rhai values
///
/// Object maps expose their keys, arrays and blobs expose `[i]` elements.
/// Host types registered with [`register`](Self::register) expose whatever
/// their [`Inspect`] implementation returns. Everything else is opaque.
#[derive(Default)]
pub struct RhaiInspector {
    custom: RwLock<Vec<MemberFn>>,
}

impl RhaiInspector {
    /// Create an inspector that only knows the built-in collection types
    pub fn new() -> Self {
        Self::default()
    }

    /// Make values of host type `T` expandable
    pub fn register<T>(&self)
    where
        T: Inspect + Clone + Send + Sync + 'static,
    {
        self.custom.write().push(Arc::new(|value: &Dynamic| {
            if !value.is::<T>() {
                return None;
            }
            value.clone().try_cast::<T>().map(|host| host.members())
        }));
    }
}

impl ValueInspector for RhaiInspector {
    fn enumerate_members(&self, value: &Value) -> Result<Vec<Member>> {
        let value = value.flatten_clone();

        if value.is_map() {
            let map = value.cast::<Map>();
            return Ok(map
                .into_iter()
                .map(|(key, v)| Member::new(key.to_string(), v))
                .collect());
        }

        if value.is_array() {
            let items = value.cast::<Array>();
            return Ok(items
                .into_iter()
                .enumerate()
                .map(|(i, v)| Member::new(format!("[{i}]"), v))
                .collect());
        }

        if value.is_blob() {
            let bytes = value.cast::<Blob>();
            return Ok(bytes
                .into_iter()
                .enumerate()
                .map(|(i, b)| Member::new(format!("[{i}]"), Dynamic::from(b as INT)))
                .collect());
        }

        for members in self.custom.read().iter() {
            if let Some(result) = members(&value) {
                return result;
            }
        }

        Ok(Vec::new())
    }
}

impl fmt::Debug for RhaiInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RhaiInspector")
            .field("custom_types", &self.custom.read().len())
            .finish()
    }
}

/// Rhai script backend
///
/// Functions defined by a job stay callable from later jobs on the same
/// engine.
#[derive(Debug)]
pub struct RhaiBackend {
    /// Rhai engine instance
    engine: Engine,
    /// Function definitions accumulated from successful jobs
    functions: AST,
    inspector: Arc<RhaiInspector>,
}

impl RhaiBackend {
    /// Create a backend configured from `config`
    pub fn new(config: &EngineConfig) -> Self {
        let mut engine = Engine::new();

        engine.set_max_expr_depths(64, 32);
        engine.set_max_operations(config.max_operations);
        engine.set_max_string_size(config.max_string_size);
        engine.set_max_call_levels(config.max_call_depth);

        engine.on_print(|text| info!(target: "scripthost::script", "{text}"));
        engine.on_debug(|text, source, pos| {
            debug!(
                target: "scripthost::script",
                source = source.unwrap_or("<dynamic>"),
                line = pos.line().unwrap_or_default(),
                "{text}"
            );
        });

        Self::register_functions(&mut engine);

        Self {
            engine,
            functions: AST::empty(),
            inspector: Arc::new(RhaiInspector::new()),
        }
    }

    /// Engine for registering host functions and types before the worker starts
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Make values of host type `T` expandable in debuggers
    pub fn register_inspected_type<T>(&self)
    where
        T: Inspect + Clone + Send + Sync + 'static,
    {
        self.inspector.register::<T>();
    }

    /// Parse `source` into a handle that later jobs can run without recompiling
    pub fn compile(&self, source: &ScriptSource) -> Result<ScriptHandle> {
        if let Some(handle) = source.handle() {
            return Ok(handle.clone());
        }
        let mut ast = self.engine.compile(source.code()?)?;
        if let Some(resource) = source.resource() {
            ast.set_source(resource);
        }
        Ok(ScriptHandle::new(
            ScriptLanguage::Rhai,
            source.resource(),
            ast,
        ))
    }

    /// Register helper functions available to every script
    fn register_functions(engine: &mut Engine) {
        engine.register_fn("parse_json", |s: &str| -> RhaiResult<Dynamic> {
            let json: serde_json::Value = serde_json::from_str(s).map_err(|e| {
                EvalAltResult::ErrorRuntime(e.to_string().into(), Position::NONE)
            })?;
            rhai::serde::to_dynamic(json)
        });

        engine.register_fn("to_json", |value: Dynamic| -> RhaiResult<String> {
            let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
            Ok(json.to_string())
        });

        engine.register_fn("unix_time", || -> INT {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as INT)
                .unwrap_or_default()
        });

        engine.register_fn("uuid", || -> String { uuid::Uuid::new_v4().to_string() });

        // Logging (for debugging scripts)
        engine.register_fn("log_debug", |msg: &str| {
            debug!(script_log = msg);
        });

        engine.register_fn("log_info", |msg: &str| {
            info!(script_log = msg);
        });

        engine.register_fn("log_warn", |msg: &str| {
            warn!(script_log = msg);
        });
    }

    /// Report every executable node to the runtime as a checkpoint
    fn install_debugger(&mut self, runtime: Arc<ExecutionRuntime>) {
        self.engine.register_debugger(
            |_engine, debugger| debugger,
            move |context, event, node, source, pos| {
                if matches!(
                    event,
                    DebuggerEvent::FunctionExitWithValue(_)
                        | DebuggerEvent::FunctionExitWithError(_)
                        | DebuggerEvent::End
                ) {
                    return Ok(DebuggerCommand::StepInto);
                }

                let Some(line) = pos.line() else {
                    return Ok(DebuggerCommand::StepInto);
                };

                let kind = if node.is_stmt() {
                    CheckpointKind::Statement
                } else {
                    CheckpointKind::Expression
                };
                let frame = RhaiFrame {
                    engine: context.engine(),
                    scope: context.scope(),
                    runtime: &runtime,
                };
                runtime
                    .checkpoint(source, line, context.call_level(), kind, &frame)
                    .map_err(|err| err.into_rhai(pos))?;

                Ok(DebuggerCommand::StepInto)
            },
        );
    }
}

fn scope_snapshot(scope: &Scope<'_>) -> Vec<(String, Value)> {
    scope
        .iter()
        .map(|(name, _, value)| (name.to_string(), value))
        .collect()
}

/// The innermost Rhai frame at a checkpoint
struct RhaiFrame<'a, 's> {
    engine: &'a Engine,
    scope: &'a Scope<'s>,
    runtime: &'a ExecutionRuntime,
}

impl FrameScope for RhaiFrame<'_, '_> {
    fn variables(&self) -> Vec<(String, Value)> {
        scope_snapshot(self.scope)
    }

    /// Evaluates against a copy of the frame, so assignments do not leak
    /// back into the suspended script.
    fn evaluate(&self, expression: &str) -> Result<Value> {
        self.runtime.muted(|| {
            let mut scope = self.scope.clone();
            self.engine
                .eval_expression_with_scope::<Dynamic>(&mut scope, expression)
                .map(Dynamic::flatten)
                .map_err(ScriptError::from)
        })
    }
}

impl ScriptBackend for RhaiBackend {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn inspector(&self) -> Arc<dyn ValueInspector> {
        self.inspector.clone()
    }

    fn supports_mid_execution_suspend(&self) -> bool {
        true
    }

    fn setup(&mut self, runtime: &Arc<ExecutionRuntime>) -> Result<()> {
        self.install_debugger(Arc::clone(runtime));
        self.engine.set_module_resolver(BridgeResolver {
            runtime: Arc::clone(runtime),
        });
        debug!(engine = runtime.engine_id(), "Rhai backend ready");
        Ok(())
    }

    fn execute(
        &mut self,
        script: &ScriptSource,
        code: &str,
        scope: &mut Variables,
    ) -> Result<Value> {
        let compiled = match script.handle() {
            Some(handle) if handle.language() != ScriptLanguage::Rhai => {
                return Err(ScriptError::unsupported_language(handle.language().to_string()));
            }
            Some(handle) => handle.program::<AST>().cloned().ok_or_else(|| {
                ScriptError::invalid_state("compiled script was not produced by a Rhai engine")
            })?,
            None => self.engine.compile(code)?,
        };
        let mut ast = self.functions.merge(&compiled);
        if let Some(resource) = script.resource() {
            ast.set_source(resource);
        } else {
            ast.clear_source();
        }

        let mut rhai_scope = Scope::new();
        for (name, value) in scope.iter() {
            rhai_scope.push_dynamic(name.clone(), value.clone());
        }

        trace!(script = %script.name(), "Evaluating script");
        let outcome = self.engine.eval_ast_with_scope::<Dynamic>(&mut rhai_scope, &ast);

        for (name, value) in scope_snapshot(&rhai_scope) {
            scope.insert(name, value);
        }

        let value = outcome?;
        self.functions.combine(compiled.clone_functions_only());
        Ok(value.flatten())
    }

    fn teardown(&mut self) {
        self.functions.clear_functions();
    }
}

/// Routes Rhai `import` statements through the engine's module bridge
#[derive(Debug)]
struct BridgeResolver {
    runtime: Arc<ExecutionRuntime>,
}

impl ModuleResolver for BridgeResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> RhaiResult<Shared<Module>> {
        let loaded = self
            .runtime
            .load_module(path, source, |resource, code| {
                let mut ast = engine.compile(code)?;
                ast.set_source(resource.id());
                let module = Module::eval_ast_as_new(Scope::new(), &ast, engine)?;
                Ok(Dynamic::from(Shared::new(module)))
            })
            .map_err(|err| err.into_rhai(pos))?;

        loaded
            .namespace()
            .clone()
            .try_cast::<Shared<Module>>()
            .ok_or_else(|| {
                ScriptError::execution(format!("module '{path}' was not loaded by a Rhai engine"))
                    .into_rhai(pos)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{MemoryLocator, ModuleBridge};
    use scripthost_core::AllowAll;

    fn backend_with(locator: MemoryLocator) -> (RhaiBackend, Arc<ExecutionRuntime>) {
        let mut backend = RhaiBackend::new(&EngineConfig::default());
        let runtime = Arc::new(ExecutionRuntime::new(
            7,
            ScriptLanguage::Rhai,
            ModuleBridge::new(Arc::new(locator)),
            Arc::new(AllowAll),
            backend.inspector(),
        ));
        backend.setup(&runtime).unwrap();
        (backend, runtime)
    }

    #[test]
    fn test_execute_returns_last_expression() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let mut vars = Variables::new();

        let value = backend
            .execute(&ScriptSource::inline(""), "let x = 40; x + 2", &mut vars)
            .unwrap();

        assert_eq!(value.as_int().unwrap(), 42);
        assert_eq!(vars["x"].as_int().unwrap(), 40);
    }

    #[test]
    fn test_scope_variables_are_visible() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let mut vars = Variables::new();
        vars.insert("greeting".to_string(), Dynamic::from("hi"));

        let value = backend
            .execute(&ScriptSource::inline(""), "greeting + \"!\"", &mut vars)
            .unwrap();
        assert_eq!(value.into_string().unwrap(), "hi!");
    }

    #[test]
    fn test_functions_persist_between_jobs() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let mut vars = Variables::new();
        let src = ScriptSource::inline("");

        backend.execute(&src, "fn double(n) { n * 2 }", &mut vars).unwrap();
        let value = backend.execute(&src, "double(21)", &mut vars).unwrap();
        assert_eq!(value.as_int().unwrap(), 42);
    }

    #[test]
    fn test_compiled_handle_runs_without_source() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let handle = backend
            .compile(&ScriptSource::inline_named("let n = seed * 2; n", "calc"))
            .unwrap();
        assert_eq!(handle.name(), Some("calc"));

        let source = ScriptSource::from(handle);
        for seed in [1_i64, 5] {
            let mut vars = Variables::new();
            vars.insert("seed".to_string(), Dynamic::from(seed));
            let value = backend.execute(&source, "", &mut vars).unwrap();
            assert_eq!(value.as_int().unwrap(), seed * 2);
        }

        let foreign = ScriptSource::from(ScriptHandle::new(ScriptLanguage::Rhai, None, 1_u8));
        let err = backend.execute(&foreign, "", &mut Variables::new()).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidState { .. }));
    }

    #[test]
    fn test_compile_error() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let err = backend
            .execute(&ScriptSource::inline(""), "let = 1;", &mut Variables::new())
            .unwrap_err();
        assert!(matches!(err, ScriptError::Compilation { .. }));
    }

    #[test]
    fn test_import_through_bridge() {
        let locator =
            MemoryLocator::new().with_module("math", "fn triple(x) { x * 3 }\nlet base = 10;");
        let (mut backend, runtime) = backend_with(locator);
        let src = ScriptSource::inline("");

        let value = backend
            .execute(
                &src,
                "import \"math\" as m;\nm::triple(m::base)",
                &mut Variables::new(),
            )
            .unwrap();
        assert_eq!(value.as_int().unwrap(), 30);

        backend
            .execute(&src, "import \"math\" as m2;\nm2::base", &mut Variables::new())
            .unwrap();
        let stats = runtime.modules().stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn test_missing_module() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let err = backend
            .execute(
                &ScriptSource::inline(""),
                "import \"pkg.missing\" as p;\n1",
                &mut Variables::new(),
            )
            .unwrap_err();
        assert_eq!(err, ScriptError::module_not_found("pkg.missing"));
    }

    #[test]
    fn test_cancelled_runtime_aborts_script() {
        let (mut backend, runtime) = backend_with(MemoryLocator::new());
        runtime.cancel();

        let err = backend
            .execute(&ScriptSource::inline(""), "let x = 1;\nx", &mut Variables::new())
            .unwrap_err();
        assert_eq!(err, ScriptError::Cancelled);
    }

    #[test]
    fn test_json_helpers() {
        let (mut backend, _) = backend_with(MemoryLocator::new());
        let value = backend
            .execute(
                &ScriptSource::inline(""),
                "let v = parse_json(`{\"a\": [1, 2]}`);\nto_json(v.a)",
                &mut Variables::new(),
            )
            .unwrap();
        assert_eq!(value.into_string().unwrap(), "[1,2]");
    }

    #[derive(Debug, Clone)]
    struct Point {
        x: INT,
        y: INT,
    }

    impl Inspect for Point {
        fn members(&self) -> Result<Vec<Member>> {
            Ok(vec![
                Member::new("x", Dynamic::from(self.x)),
                Member::new("y", Dynamic::from(self.y)),
            ])
        }
    }

    #[test]
    fn test_inspector_members() {
        let inspector = RhaiInspector::new();

        let mut map = Map::new();
        map.insert("name".into(), Dynamic::from("rhai"));
        let members = inspector.enumerate_members(&Dynamic::from(map)).unwrap();
        assert_eq!(members[0].name, "name");

        let array: Array = vec![Dynamic::from(1_i64), Dynamic::from(true)];
        let names: Vec<_> = inspector
            .enumerate_members(&Dynamic::from(array))
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, ["[0]", "[1]"]);

        assert!(inspector.enumerate_members(&Dynamic::from(5_i64)).unwrap().is_empty());

        let point = Dynamic::from(Point { x: 1, y: 2 });
        assert!(inspector.enumerate_members(&point).unwrap().is_empty());
        inspector.register::<Point>();
        assert_eq!(inspector.enumerate_members(&point).unwrap().len(), 2);
    }
}
