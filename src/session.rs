//! Host façade
//!
//! A [`Session`] owns everything a host needs to compile and run rill code:
//! the scanner set, registered natives and structs, the current chunk, the
//! VM and the debugger. Nothing is global; independent sessions share no
//! state.

use crate::bytecode::{Chunk, FunctionType, NativeFunction, SourcePosition};
use crate::compiler::{CompileOptions, Compiler, Mode, EXPRESSION_ENTRY};
use crate::debugger::{Breakpoint, Debugger, LocalVariable};
use crate::error::{CompileError, NativeError, RuntimeError};
use crate::lexer::ScannerSet;
use crate::marshal::{
    define, DefinitionContext, DefinitionOutcome, FunctionHandle, HostStruct, Marshal, MarshalArgs, NativeCallback,
    NativeSignature, Reader, RuntimeContext, Writer,
};
use crate::token::Slice;
use crate::value::{TypeRegistry, Value, ValueType};
use crate::vm::{VirtualMachine, VmConfig};
use std::fmt::Write as _;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// A registered native and its callback.
struct NativeEntry {
    signature: NativeSignature,
    callback: NativeCallback,
    builtin: bool,
}

/// Compile and run context
pub struct Session {
    scanners: ScannerSet,
    natives: Vec<NativeEntry>,
    types: TypeRegistry,
    chunk: Chunk,
    /// Whether `chunk` came from a compile with zero diagnostics.
    compiled: bool,
    vm: VirtualMachine,
    debugger: Debugger,
    /// Registration errors waiting to be reported by the next compile.
    pending: Vec<CompileError>,
    runtime_error: Option<RuntimeError>,
    /// Bumped by every compile; stamps the handles it hands out.
    generation: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut session = Self {
            scanners: ScannerSet::language(),
            natives: Vec::new(),
            types: TypeRegistry::new(),
            chunk: Chunk::default(),
            compiled: false,
            vm: VirtualMachine::new(config),
            debugger: Debugger::new(),
            pending: Vec::new(),
            runtime_error: None,
            generation: 0,
        };
        session.register_prelude();
        session
    }

    // ==================== Registration ====================

    /// Register a host function. `definition` declares the name, parameters
    /// and return type; `callback` runs on every call.
    ///
    /// A failed registration adds nothing; its error is returned and also
    /// reported by the next compile.
    pub fn add_function<D, F>(&mut self, definition: D, callback: F) -> Result<(), CompileError>
    where
        D: FnOnce(&mut DefinitionContext<'_>) -> Result<(), NativeError>,
        F: Fn(&mut RuntimeContext<'_>) -> Result<(), NativeError> + 'static,
    {
        self.register_native(definition, Rc::new(callback), false)
    }

    /// Register the field layout of a host struct.
    pub fn add_struct<T: HostStruct>(&mut self) -> Result<(), CompileError> {
        let registered = match T::fields(&self.types) {
            Ok(fields) => self.types.register(T::NAME, &fields),
            Err(error) => Err(error.to_string()),
        };
        let result = match registered {
            Ok(ty) => {
                debug!(target: "rill::session", name = T::NAME, size = ty.size(), "registered struct");
                Ok(())
            }
            Err(message) => Err(CompileError::detached(format!(
                "Error when adding struct '{}': {}",
                T::NAME,
                message
            ))),
        };
        self.queue_failure(result)
    }

    fn register_native<D>(&mut self, definition: D, callback: NativeCallback, builtin: bool) -> Result<(), CompileError>
    where
        D: FnOnce(&mut DefinitionContext<'_>) -> Result<(), NativeError>,
    {
        let result = match define(&self.types, definition) {
            DefinitionOutcome::Complete(signature) => {
                if self.natives.iter().any(|n| n.signature.name == signature.name) {
                    Err(CompileError::detached(format!(
                        "Error when adding native function: '{}' is already defined",
                        signature.name
                    )))
                } else {
                    debug!(target: "rill::session", name = %signature.name, builtin, "registered native function");
                    self.natives.push(NativeEntry {
                        signature,
                        callback,
                        builtin,
                    });
                    Ok(())
                }
            }
            DefinitionOutcome::Incomplete => Err(CompileError::detached("No native function body found")),
            DefinitionOutcome::Failed(error) => Err(CompileError::detached(format!(
                "Error when adding native function: {}",
                error
            ))),
        };
        self.queue_failure(result)
    }

    fn queue_failure(&mut self, result: Result<(), CompileError>) -> Result<(), CompileError> {
        if let Err(error) = &result {
            warn!(target: "rill::session", %error, "registration failed");
            self.pending.push(error.clone());
        }
        result
    }

    fn register_prelude(&mut self) {
        let prelude: [(&str, fn(&mut DefinitionContext<'_>) -> Result<(), NativeError>, NativeCallback); 5] = [
            (
                "print",
                |def: &mut DefinitionContext<'_>| {
                    def.name("print").param::<String>("value")?;
                    def.returns::<()>()
                },
                Rc::new(|ctx: &mut RuntimeContext<'_>| {
                    println!("{}", ctx.arg::<String>(0)?);
                    Ok(())
                }),
            ),
            (
                "int_to_string",
                |def: &mut DefinitionContext<'_>| {
                    def.name("int_to_string").param::<i64>("value")?;
                    def.returns::<String>()
                },
                Rc::new(|ctx: &mut RuntimeContext<'_>| {
                    let value = ctx.arg::<i64>(0)?;
                    ctx.ret(value.to_string())
                }),
            ),
            (
                "float_to_string",
                |def: &mut DefinitionContext<'_>| {
                    def.name("float_to_string").param::<f64>("value")?;
                    def.returns::<String>()
                },
                Rc::new(|ctx: &mut RuntimeContext<'_>| {
                    let value = ctx.arg::<f64>(0)?;
                    ctx.ret(Value::Float(value).to_string())
                }),
            ),
            (
                "to_float",
                |def: &mut DefinitionContext<'_>| {
                    def.name("to_float").param::<i64>("value")?;
                    def.returns::<f64>()
                },
                Rc::new(|ctx: &mut RuntimeContext<'_>| {
                    let value = ctx.arg::<i64>(0)?;
                    ctx.ret(value as f64)
                }),
            ),
            (
                "to_int",
                |def: &mut DefinitionContext<'_>| {
                    def.name("to_int").param::<f64>("value")?;
                    def.returns::<i64>()
                },
                Rc::new(|ctx: &mut RuntimeContext<'_>| {
                    let value = ctx.arg::<f64>(0)?;
                    if !value.is_finite() || value < i64::MIN as f64 || value >= i64::MAX as f64 {
                        return Err(NativeError::failed(format!("{:?} does not fit in an int", value)));
                    }
                    ctx.ret(value.trunc() as i64)
                }),
            ),
        ];

        for (name, definition, callback) in prelude {
            if self.register_native(definition, callback, true).is_err() {
                warn!(target: "rill::session", name, "prelude function was not registered");
            }
        }
        self.pending.clear();
    }

    // ==================== Compilation ====================

    /// Compile one source file. An empty list means success.
    pub fn compile_source(&mut self, name: &str, text: &str, mode: Mode, options: CompileOptions) -> Vec<CompileError> {
        self.compile_sources(&[(name, text)], mode, options)
    }

    /// Compile several sources into one chunk; functions may call across
    /// sources.
    pub fn compile_sources(&mut self, sources: &[(&str, &str)], mode: Mode, options: CompileOptions) -> Vec<CompileError> {
        let mut chunk = self.new_chunk(mode);
        let mut errors = std::mem::take(&mut self.pending);
        errors.extend(Compiler::new(&self.scanners, options).compile(&mut chunk, sources));
        self.install(chunk, errors)
    }

    /// Compile a single expression in debug mode; run it with
    /// [`Session::evaluate`].
    pub fn compile_expression(&mut self, text: &str) -> Vec<CompileError> {
        let mut chunk = self.new_chunk(Mode::Debug);
        let mut errors = std::mem::take(&mut self.pending);
        errors.extend(Compiler::new(&self.scanners, CompileOptions::default()).compile_expression(&mut chunk, text));
        self.install(chunk, errors)
    }

    /// A fresh chunk seeded with the registered structs and natives.
    fn new_chunk(&self, mode: Mode) -> Chunk {
        let mut chunk = Chunk::new(mode);
        chunk.types = self.types.clone();
        for native in &self.natives {
            let parameters = native.signature.parameters.iter().map(|(_, ty)| *ty).collect();
            let type_index = chunk.add_function_type(FunctionType::new(parameters, native.signature.return_type));
            chunk.natives.push(NativeFunction {
                name: native.signature.name.clone(),
                type_index,
                callback: Rc::clone(&native.callback),
                builtin: native.builtin,
            });
        }
        chunk
    }

    fn install(&mut self, chunk: Chunk, errors: Vec<CompileError>) -> Vec<CompileError> {
        self.compiled = errors.is_empty();
        self.chunk = chunk;
        self.generation += 1;
        self.runtime_error = None;
        self.vm.reset(&self.chunk);
        info!(
            target: "rill::session",
            functions = self.chunk.functions.len(),
            instructions = self.chunk.len(),
            errors = errors.len(),
            "compile finished"
        );
        errors
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    // ==================== Execution ====================

    /// Look up a compiled function by name and exact signature.
    pub fn get_function<A: MarshalArgs, R: Marshal>(&self, name: &str) -> Option<FunctionHandle<A, R>> {
        if !self.compiled {
            return None;
        }
        let wanted = FunctionType::new(A::value_types(&self.chunk.types).ok()?, R::value_type(&self.chunk.types).ok()?);
        self.chunk
            .functions
            .iter()
            .position(|f| f.name == name && self.chunk.function_types.get(f.type_index) == Some(&wanted))
            .map(|index| FunctionHandle::new(index, self.generation))
    }

    /// Whether a zero-argument function called `name` was compiled.
    pub fn has_entry(&self, name: &str) -> bool {
        self.entry_index(name).is_some()
    }

    fn entry_index(&self, name: &str) -> Option<usize> {
        if !self.compiled {
            return None;
        }
        self.chunk.functions.iter().position(|f| {
            f.name == name
                && self
                    .chunk
                    .function_types
                    .get(f.type_index)
                    .is_some_and(|t| t.parameters.is_empty())
        })
    }

    /// Run the expression compiled by [`Session::compile_expression`].
    pub fn evaluate(&mut self) -> Result<Value, RuntimeError> {
        self.call_entry(EXPRESSION_ENTRY)
    }

    /// Run a zero-argument function of any return type and decode its result.
    pub fn call_entry(&mut self, name: &str) -> Result<Value, RuntimeError> {
        let index = self
            .entry_index(name)
            .ok_or_else(|| RuntimeError::new(Slice::default(), format!("no function '{}' taking no arguments", name)))?;
        let return_type = self
            .chunk
            .functions
            .get(index)
            .and_then(|f| self.chunk.function_types.get(f.type_index))
            .map_or(ValueType::Unit, |t| t.return_type);

        self.vm.reset(&self.chunk);
        let bytes = self.run(index, Vec::new())?;
        let value = Value::decode(&bytes, return_type, &self.chunk.types, self.vm.strings());
        value.ok_or_else(|| self.record(RuntimeError::new(Slice::default(), "could not decode the result")))
    }

    /// Call through a typed handle. Used by [`FunctionHandle::call`].
    fn call_function<A: MarshalArgs, R: Marshal>(&mut self, handle: &FunctionHandle<A, R>, args: A) -> Result<R, RuntimeError> {
        if handle.generation() != self.generation {
            return Err(self.record(RuntimeError::new(
                Slice::default(),
                "stale function handle: the program was recompiled after the lookup",
            )));
        }
        let index = handle.index();
        self.vm.reset(&self.chunk);
        let bytes = {
            let mut writer = Writer::new(self.vm.strings_mut());
            args.write_all(&mut writer);
            writer.into_bytes()
        };
        let bytes = self.run(index, bytes)?;
        let result = R::read(&mut Reader::new(&bytes, self.vm.strings()));
        result.map_err(|e| self.record(RuntimeError::new(Slice::default(), e.to_string())))
    }

    /// Execute function `index` with pre-marshaled argument bytes. The VM
    /// must have been reset before the arguments were marshaled.
    fn run(&mut self, index: usize, arguments: Vec<u8>) -> Result<Vec<u8>, RuntimeError> {
        if !self.compiled {
            return Err(self.record(RuntimeError::new(Slice::default(), "no successfully compiled program")));
        }
        self.runtime_error = None;
        self.debugger.reset();

        let parameters = self
            .chunk
            .functions
            .get(index)
            .and_then(|f| self.chunk.function_types.get(f.type_index))
            .map(|t| t.parameters.clone())
            .unwrap_or_default();
        let mut offset = 0;
        for ty in parameters {
            let size = ty.size();
            let Some(bytes) = arguments.get(offset..offset + size) else {
                return Err(self.record(RuntimeError::new(Slice::default(), "argument bytes missing")));
            };
            self.vm.push_argument(bytes, ty);
            offset += size;
        }

        self.vm
            .execute(&self.chunk, index, &mut self.debugger)
            .map_err(|error| self.record(error))
    }

    fn record(&mut self, error: RuntimeError) -> RuntimeError {
        warn!(target: "rill::session", %error, "run failed");
        self.runtime_error = Some(error.clone());
        error
    }

    /// The error of the last failed run, until the next run or compile.
    pub fn runtime_error(&self) -> Option<&RuntimeError> {
        self.runtime_error.as_ref()
    }

    // ==================== Introspection ====================

    pub fn disassemble(&self) -> String {
        self.chunk.disassemble()
    }

    /// Live call frames of the last failed run, outermost first.
    pub fn trace_call_stack(&self) -> String {
        self.vm.trace_call_stack(&self.chunk)
    }

    /// Render a diagnostic with its source line and a caret underline.
    pub fn format_compile_error(&self, error: &CompileError) -> String {
        let mut report = format!("error: {}\n", error.message);
        if error.slice != Slice::default() {
            self.annotate(&mut report, error.slice);
        }
        report
    }

    /// Render a runtime error with its source line and the call stack.
    pub fn format_runtime_error(&self, error: &RuntimeError) -> String {
        let mut report = format!("runtime error: {}\n", error.message);
        if error.position.is_some() {
            self.annotate(&mut report, error.slice);
        }
        let trace = self.trace_call_stack();
        if !trace.is_empty() {
            report.push_str("call stack:\n");
            report.push_str(&trace);
        }
        report
    }

    fn annotate(&self, report: &mut String, slice: Slice) {
        let (Some(source), Some(position)) = (self.chunk.source_for(slice.index), self.chunk.position(slice.index))
        else {
            return;
        };
        let local = (slice.index - source.offset).min(source.content.len());
        let line_start = source.content[..local].rfind('\n').map_or(0, |i| i + 1);
        let column = local - line_start;
        let text = self.chunk.line_text(slice.index).unwrap_or("");
        let gutter = " ".repeat(position.line.to_string().len());
        let underline = "^".repeat(slice.length.clamp(1, text.len().saturating_sub(column).max(1)));

        let _ = writeln!(report, "{}--> {}:{}", gutter, position, column + 1);
        let _ = writeln!(report, "{} |", gutter);
        let _ = writeln!(report, "{} | {}", position.line, text);
        let _ = writeln!(report, "{} | {}{}", gutter, " ".repeat(column), underline);
    }

    // ==================== Debugging ====================

    pub fn add_debug_hook<F>(&mut self, hook: F)
    where
        F: FnMut(&Breakpoint, &[LocalVariable]) + 'static,
    {
        self.debugger.add_hook(Box::new(hook));
    }

    /// Break on `line` (1-based) of source `uri` in the compiled chunk.
    pub fn add_breakpoint(&mut self, uri: &str, line: usize) -> Result<(), CompileError> {
        let region = self
            .chunk
            .line_region(uri, line)
            .ok_or_else(|| CompileError::detached(format!("no line {} in source '{}'", line, uri)))?;
        let position = SourcePosition {
            uri: uri.to_string(),
            line,
        };
        debug!(target: "rill::session", %position, "breakpoint added");
        self.debugger.add_breakpoint(Breakpoint { position, region });
        Ok(())
    }

    pub fn clear_breakpoints(&mut self) {
        self.debugger.clear_breakpoints();
    }
}

impl<A: MarshalArgs, R: Marshal> FunctionHandle<A, R> {
    /// Run the function. On failure the error is also kept in the session.
    pub fn call(&self, session: &mut Session, args: A) -> Result<R, RuntimeError> {
        session.call_function(self, args)
    }
}
