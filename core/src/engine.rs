//! file: core/src/engine.rs
//! description: source-to-result facade over compiler, cache and VM.
//!
//! The engine owns one `VirtualMachine` with the builtins installed. Source
//! text goes through the external `Compiler` unless a cached `.yakc` blob
//! for the same text, engine version and key decodes cleanly; `.yakc` input
//! bypasses the compiler entirely.

use std::sync::Arc;

use log::{debug, warn};

use crate::cache::CodeCache;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::vm::bytecode::CodesMarshaller;
use crate::vm::context::Context;
use crate::vm::debugger::Debugger;
use crate::vm::host;
use crate::vm::op::Program;
use crate::vm::value::Value;
use crate::vm::VirtualMachine;

/// Boundary to the external front end. Errors are forwarded verbatim.
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Program, String>;
}

impl<F> Compiler for F
where
    F: Fn(&str) -> Result<Program, String> + Send + Sync,
{
    fn compile(&self, source: &str) -> Result<Program, String> {
        self(source)
    }
}

pub struct Engine {
    vm: VirtualMachine,
    compiler: Arc<dyn Compiler>,
    marshaller: CodesMarshaller,
    cache: Arc<CodeCache>,
}

impl Engine {
    pub fn new(config: VmConfig, compiler: Arc<dyn Compiler>) -> Self {
        let cache = Arc::new(CodeCache::new(config.cache_dir.clone(), config.min_cache_len));
        let vm = VirtualMachine::new(config);
        host::install(&vm);
        Engine { vm, compiler, marshaller: CodesMarshaller::new(), cache }
    }

    /// Encrypts produced blobs and decrypts consumed ones with `key`.
    pub fn with_key(mut self, key: [u8; 16]) -> Self {
        self.marshaller = CodesMarshaller::with_key(key);
        self
    }

    /// Shares a cache between engines, e.g. one per process.
    pub fn with_cache(mut self, cache: Arc<CodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn import(&self, name: impl Into<String>, value: Value) -> &Self {
        self.vm.import(name, value);
        self
    }

    pub fn debugger(&self, debugger: Debugger) -> &Self {
        self.vm.set_debugger(debugger);
        self
    }

    pub fn vm(&self) -> &VirtualMachine {
        &self.vm
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    /// Runs source text or a `.yakc` blob.
    pub fn eval(&self, ctx: &Context, source: impl AsRef<[u8]>) -> Result<Value, VmError> {
        let bytes = source.as_ref();
        if CodesMarshaller::is_yakc(bytes) {
            return self.exec_yakc(ctx, bytes);
        }
        let text = std::str::from_utf8(bytes).map_err(|e| VmError::Compile(format!("source is not utf-8: {}", e)))?;
        let program = self.load_or_compile(text)?;
        self.vm.exec_program(ctx, &program)
    }

    pub fn exec_yakc(&self, ctx: &Context, bytes: &[u8]) -> Result<Value, VmError> {
        let program = self.marshaller.unmarshal(bytes)?;
        self.vm.exec_program(ctx, &program)
    }

    pub fn compile(&self, source: &str) -> Result<Program, VmError> {
        self.compiler.compile(source).map_err(VmError::Compile)
    }

    pub fn compile_to_yakc(&self, source: &str) -> Result<Vec<u8>, VmError> {
        let program = self.compile(source)?;
        self.marshaller.marshal_program(&program)
    }

    /// A cached blob that fails to decode is never fatal: the source is
    /// compiled again and the entry replaced.
    fn load_or_compile(&self, source: &str) -> Result<Program, VmError> {
        let key = self.marshaller.key();
        if let Some(blob) = self.cache.load(source, key) {
            match self.marshaller.unmarshal(&blob) {
                Ok(program) => return Ok(program),
                Err(e) => {
                    warn!("cached yakc is unusable ({}); recompiling", e);
                    self.cache.invalidate(source, key);
                }
            }
        }

        let program = self.compile(source)?;
        if self.cache.accepts(source) {
            match self.marshaller.marshal_program(&program) {
                Ok(blob) => {
                    self.cache.store(source, key, &blob);
                }
                Err(e) => warn!("cannot cache compiled program: {}", e),
            }
        } else {
            debug!("source below cache threshold ({} < {})", source.len(), self.cache.min_len());
        }
        Ok(program)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("vm", &self.vm).field("marshaller", &self.marshaller).field("cache", &self.cache).finish()
    }
}
