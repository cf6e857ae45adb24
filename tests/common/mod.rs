//! Fakes of the runtime's profiling and metadata interfaces, shared by the integration tests.
#![allow(dead_code)]

pub mod interpreter;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use dotweave::{
    metadata::signature::TypeNameResolver,
    prelude::*,
    profiler::EventMask,
};

use interpreter::{CallHost, CallResult, Value};

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Encode a fat body around `code`.
pub fn fat_body(code: &[u8], max_stack: u16, clauses: &[ExceptionHandler]) -> Vec<u8> {
    MethodBodyWriter::new(code)
        .max_stack(max_stack)
        .force_fat()
        .exception_handlers(clauses)
        .build()
        .unwrap()
}

/// Encode a tiny body around `code`.
pub fn tiny_body(code: &[u8]) -> Vec<u8> {
    MethodBodyWriter::new(code).build().unwrap()
}

/// The `MemberRef` tokens of the fixed helper set used without module metadata.
pub struct TestTokens;

impl TestTokens {
    pub const ENTER: Token = Token(0x0A00_0001);
    pub const EXIT_VOID: Token = Token(0x0A00_0002);
    pub const EXIT_VALUE: Token = Token(0x0A00_0003);
    pub const OBJECT: Token = Token(0x0100_0001);
    pub const LOCALS: Token = Token(0x1100_0001);
    /// `static void Fail()`, always throws
    pub const FAIL: Token = Token(0x0A00_0010);
    /// `static int Double(int)`
    pub const DOUBLE: Token = Token(0x0A00_0011);

    pub fn signature(token: Token) -> Option<MethodSignature> {
        Some(match token {
            Self::ENTER => MethodSignature::static_method(TypeSig::I8, vec![TypeSig::I4]),
            Self::EXIT_VOID => {
                MethodSignature::static_method(TypeSig::Void, vec![TypeSig::Object, TypeSig::I8])
            }
            Self::EXIT_VALUE => MethodSignature::static_method(
                TypeSig::Void,
                vec![TypeSig::I4, TypeSig::Object, TypeSig::I8],
            ),
            Self::FAIL => MethodSignature::static_method(TypeSig::Void, vec![]),
            Self::DOUBLE => MethodSignature::static_method(TypeSig::I4, vec![TypeSig::I4]),
            _ => return None,
        })
    }
}

impl HelperTokenSource for TestTokens {
    fn enter(&self) -> Result<Token> {
        Ok(Self::ENTER)
    }

    fn exit(&self, ret: Option<&TypeSig>) -> Result<Token> {
        Ok(if ret.is_some() {
            Self::EXIT_VALUE
        } else {
            Self::EXIT_VOID
        })
    }

    fn exception_type(&self) -> Result<Token> {
        Ok(Self::OBJECT)
    }

    fn local_signature(&self, _blob: &[u8]) -> Result<Token> {
        Ok(Self::LOCALS)
    }
}

impl CallSiteResolver for TestTokens {
    fn signature(&self, token: Token) -> Result<MethodSignature> {
        Self::signature(token).ok_or(Error::TokenNotFound(token))
    }
}

/// What a host method does when interpreted code calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMethod {
    Enter,
    Exit(usize),
    Fail,
    Double,
}

/// Records every helper invocation made by interpreted code.
#[derive(Default)]
pub struct RecordingHost {
    methods: HashMap<Token, HostMethod>,
    /// Method tokens passed to the entry helper
    pub enters: Vec<i64>,
    /// Arguments of each exit helper call: `[return value,] exception, correlation`
    pub exits: Vec<Vec<Value>>,
    next_correlation: i64,
}

impl RecordingHost {
    /// Host for code using [`TestTokens`].
    pub fn new() -> Self {
        RecordingHost::default()
            .with(TestTokens::ENTER, HostMethod::Enter)
            .with(TestTokens::EXIT_VOID, HostMethod::Exit(2))
            .with(TestTokens::EXIT_VALUE, HostMethod::Exit(3))
            .with(TestTokens::FAIL, HostMethod::Fail)
            .with(TestTokens::DOUBLE, HostMethod::Double)
    }

    /// Host for code whose helper references were emitted into `metadata`.
    pub fn for_module(metadata: &FakeMetadata) -> Self {
        let mut host = RecordingHost::default()
            .with(TestTokens::FAIL, HostMethod::Fail)
            .with(TestTokens::DOUBLE, HostMethod::Double);
        for (token, name, signature) in metadata.member_refs() {
            let arity = MethodSignature::parse(&signature).unwrap().params.len();
            let method = if name == "OnMethodBegin" {
                HostMethod::Enter
            } else {
                HostMethod::Exit(arity)
            };
            host.methods.insert(token, method);
        }
        host
    }

    pub fn with(mut self, token: Token, method: HostMethod) -> Self {
        self.methods.insert(token, method);
        self
    }
}

impl CallHost for RecordingHost {
    fn arity(&self, token: Token) -> usize {
        match self.methods.get(&token) {
            Some(HostMethod::Enter | HostMethod::Double) => 1,
            Some(HostMethod::Exit(arity)) => *arity,
            Some(HostMethod::Fail) => 0,
            None => panic!("call to unknown method {token}"),
        }
    }

    fn call(&mut self, token: Token, args: Vec<Value>) -> CallResult {
        match self.methods[&token] {
            HostMethod::Enter => {
                self.enters.push(match args[0] {
                    Value::Int(token) => token,
                    other => panic!("entry helper received {other:?}"),
                });
                self.next_correlation += 1;
                CallResult::Return(Some(Value::Int(1000 + self.next_correlation)))
            }
            HostMethod::Exit(_) => {
                self.exits.push(args);
                CallResult::Return(None)
            }
            HostMethod::Fail => CallResult::Throw(Value::Object(7)),
            HostMethod::Double => match args[0] {
                Value::Int(value) => CallResult::Return(Some(Value::Int(value * 2))),
                other => panic!("Double received {other:?}"),
            },
        }
    }
}

#[derive(Default)]
struct Tables {
    assembly_refs: Vec<String>,
    type_refs: Vec<(Token, String)>,
    member_refs: Vec<(Token, String, Vec<u8>)>,
    standalone: Vec<Vec<u8>>,
    emitted: Vec<String>,
}

/// In-memory module metadata supporting import and emission.
pub struct FakeMetadata {
    types: HashMap<Token, String>,
    methods: HashMap<Token, MethodProps>,
    tables: Mutex<Tables>,
    conflicts: AtomicUsize,
}

impl FakeMetadata {
    /// `AssemblyRef` of the core library, present in every module
    pub const CORE_LIBRARY: Token = Token(0x2300_0001);

    pub fn new() -> Self {
        FakeMetadata {
            types: HashMap::new(),
            methods: HashMap::new(),
            tables: Mutex::new(Tables {
                assembly_refs: vec!["System.Runtime".to_string()],
                ..Tables::default()
            }),
            conflicts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` emissions with a conflict.
    pub fn with_conflicts(self, count: usize) -> Self {
        self.conflicts.store(count, Ordering::SeqCst);
        self
    }

    /// Define a type; returns its `TypeDef` token.
    pub fn add_type(&mut self, full_name: &str) -> Token {
        let token = Token::from_parts(Token::TYPE_DEF_TABLE, self.types.len() as u32 + 1);
        self.types.insert(token, full_name.to_string());
        token
    }

    /// Define a method; returns its `MethodDef` token.
    pub fn add_method(
        &mut self,
        type_token: Token,
        name: &str,
        signature: &MethodSignature,
    ) -> Token {
        let token = Token::from_parts(Token::METHOD_DEF_TABLE, self.methods.len() as u32 + 1);
        self.methods.insert(
            token,
            MethodProps {
                token,
                type_token,
                name: name.to_string(),
                signature: signature.encode().unwrap(),
            },
        );
        token
    }

    /// Define a local variable signature; returns its `StandAloneSig` token.
    pub fn add_locals(&self, blob: &[u8]) -> Token {
        let mut tables = self.tables.lock().unwrap();
        tables.standalone.push(blob.to_vec());
        Token::from_parts(Token::STANDALONE_SIG_TABLE, tables.standalone.len() as u32)
    }

    /// Emitted `MemberRef` rows: token, name and signature.
    pub fn member_refs(&self) -> Vec<(Token, String, Vec<u8>)> {
        self.tables.lock().unwrap().member_refs.clone()
    }

    /// Description of every row emitted, in order.
    pub fn emitted(&self) -> Vec<String> {
        self.tables.lock().unwrap().emitted.clone()
    }

    fn conflict(&self, what: &str) -> Result<()> {
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(Error::MetadataEmissionConflict(what.to_string()));
        }
        Ok(())
    }
}

impl TypeNameResolver for FakeMetadata {
    fn type_name(&self, token: Token) -> Result<String> {
        if let Some(name) = self.types.get(&token) {
            return Ok(name.clone());
        }
        let tables = self.tables.lock().unwrap();
        tables
            .type_refs
            .iter()
            .enumerate()
            .find(|(index, _)| Token::from_parts(Token::TYPE_REF_TABLE, *index as u32 + 1) == token)
            .map(|(_, (_, name))| name.clone())
            .ok_or(Error::TokenNotFound(token))
    }
}

impl MetadataImport for FakeMetadata {
    fn method_props(&self, method: Token) -> Result<MethodProps> {
        self.methods
            .get(&method)
            .cloned()
            .ok_or(Error::TokenNotFound(method))
    }

    fn member_signature(&self, token: Token) -> Result<Vec<u8>> {
        if let Some(props) = self.methods.get(&token) {
            return Ok(props.signature.clone());
        }
        let tables = self.tables.lock().unwrap();
        if let Some((_, _, signature)) = tables.member_refs.iter().find(|row| row.0 == token) {
            return Ok(signature.clone());
        }
        drop(tables);

        TestTokens::signature(token)
            .ok_or(Error::TokenNotFound(token))?
            .encode()
    }

    fn standalone_signature(&self, token: Token) -> Result<Vec<u8>> {
        let tables = self.tables.lock().unwrap();
        (token.row() as usize)
            .checked_sub(1)
            .and_then(|index| tables.standalone.get(index))
            .cloned()
            .ok_or(Error::TokenNotFound(token))
    }

    fn core_library(&self) -> Result<Token> {
        Ok(Self::CORE_LIBRARY)
    }
}

impl MetadataEmit for FakeMetadata {
    fn define_assembly_ref(&self, name: &str) -> Result<Token> {
        self.conflict(name)?;
        let mut tables = self.tables.lock().unwrap();
        tables.assembly_refs.push(name.to_string());
        tables.emitted.push(format!("AssemblyRef {name}"));
        Ok(Token::from_parts(
            Token::ASSEMBLY_REF_TABLE,
            tables.assembly_refs.len() as u32,
        ))
    }

    fn define_type_ref(&self, scope: Token, full_name: &str) -> Result<Token> {
        self.conflict(full_name)?;
        let mut tables = self.tables.lock().unwrap();
        tables.type_refs.push((scope, full_name.to_string()));
        tables.emitted.push(format!("TypeRef {scope} {full_name}"));
        Ok(Token::from_parts(
            Token::TYPE_REF_TABLE,
            tables.type_refs.len() as u32,
        ))
    }

    fn define_member_ref(&self, parent: Token, name: &str, signature: &[u8]) -> Result<Token> {
        self.conflict(name)?;
        let mut tables = self.tables.lock().unwrap();
        let token = Token::from_parts(
            Token::MEMBER_REF_TABLE,
            tables.member_refs.len() as u32 + 1,
        );
        tables
            .member_refs
            .push((token, name.to_string(), signature.to_vec()));
        tables
            .emitted
            .push(format!("MemberRef {parent} {name} {signature:02x?}"));
        Ok(token)
    }

    fn define_standalone_sig(&self, blob: &[u8]) -> Result<Token> {
        self.conflict("local signature")?;
        let mut tables = self.tables.lock().unwrap();
        tables.standalone.push(blob.to_vec());
        tables.emitted.push(format!("StandAloneSig {blob:02x?}"));
        Ok(Token::from_parts(
            Token::STANDALONE_SIG_TABLE,
            tables.standalone.len() as u32,
        ))
    }
}

struct LoadedModule {
    info: ModuleInfo,
    metadata: Arc<FakeMetadata>,
}

/// Called with the module a body is read from or installed into.
pub type BodyHook = Arc<dyn Fn(ModuleId) + Send + Sync>;

/// The runtime's information interface over in-memory modules and bodies.
#[derive(Default)]
pub struct FakeProfilerInfo {
    functions: Mutex<HashMap<FunctionId, FunctionInfo>>,
    modules: Mutex<HashMap<ModuleId, LoadedModule>>,
    bodies: Mutex<HashMap<(ModuleId, Token), Vec<u8>>>,
    installed: Mutex<HashMap<(ModuleId, Token), Vec<u8>>>,
    installs: AtomicUsize,
    refuse_install: AtomicBool,
    read_hook: Mutex<Option<BodyHook>>,
    install_hook: Mutex<Option<BodyHook>>,
}

fn fire(hook: &Mutex<Option<BodyHook>>, module: ModuleId) {
    let hook = hook.lock().unwrap().clone();
    if let Some(hook) = hook {
        hook(module);
    }
}

impl FakeProfilerInfo {
    pub fn new() -> Self {
        FakeProfilerInfo::default()
    }

    pub fn add_module(
        &self,
        module: ModuleId,
        assembly: AssemblyId,
        assembly_name: &str,
        version: &str,
        metadata: Arc<FakeMetadata>,
    ) {
        self.modules.lock().unwrap().insert(
            module,
            LoadedModule {
                info: ModuleInfo {
                    name: format!("{assembly_name}.dll"),
                    assembly,
                    assembly_name: assembly_name.to_string(),
                    assembly_version: version.parse().unwrap(),
                },
                metadata,
            },
        );
    }

    pub fn add_function(&self, function: FunctionId, module: ModuleId, token: Token, body: Vec<u8>) {
        self.functions
            .lock()
            .unwrap()
            .insert(function, FunctionInfo { module, token });
        self.bodies.lock().unwrap().insert((module, token), body);
    }

    /// Make every `set_il_function_body` fail.
    pub fn refuse_install(&self) {
        self.refuse_install.store(true, Ordering::SeqCst);
    }

    /// Run `hook` every time an original body is read.
    pub fn on_body_read(&self, hook: impl Fn(ModuleId) + Send + Sync + 'static) {
        *self.read_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Run `hook` at the start of every `set_il_function_body`.
    pub fn on_install(&self, hook: impl Fn(ModuleId) + Send + Sync + 'static) {
        *self.install_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// The body the runtime would compile: the installed one, else the original.
    pub fn body(&self, module: ModuleId, token: Token) -> Vec<u8> {
        if let Some(body) = self.installed(module, token) {
            return body;
        }
        self.bodies.lock().unwrap()[&(module, token)].clone()
    }

    pub fn installed(&self, module: ModuleId, token: Token) -> Option<Vec<u8>> {
        self.installed.lock().unwrap().get(&(module, token)).cloned()
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn metadata(&self, module: ModuleId) -> Arc<FakeMetadata> {
        self.modules.lock().unwrap()[&module].metadata.clone()
    }
}

impl ProfilerInfo for FakeProfilerInfo {
    fn function_info(&self, function: FunctionId) -> Result<FunctionInfo> {
        self.functions
            .lock()
            .unwrap()
            .get(&function)
            .copied()
            .ok_or(Error::UnknownModule(function.0))
    }

    fn module_info(&self, module: ModuleId) -> Result<ModuleInfo> {
        self.modules
            .lock()
            .unwrap()
            .get(&module)
            .map(|loaded| loaded.info.clone())
            .ok_or(Error::UnknownModule(module.0))
    }

    fn module_metadata(&self, module: ModuleId) -> Result<Arc<dyn ModuleMetadata>> {
        let modules = self.modules.lock().unwrap();
        let loaded = modules.get(&module).ok_or(Error::UnknownModule(module.0))?;
        let metadata: Arc<dyn ModuleMetadata> = loaded.metadata.clone();
        Ok(metadata)
    }

    fn il_function_body(&self, module: ModuleId, method: Token) -> Result<Vec<u8>> {
        fire(&self.read_hook, module);
        self.bodies
            .lock()
            .unwrap()
            .get(&(module, method))
            .cloned()
            .ok_or(Error::TokenNotFound(method))
    }

    fn set_il_function_body(&self, module: ModuleId, method: Token, body: &[u8]) -> Result<()> {
        fire(&self.install_hook, module);
        if self.refuse_install.load(Ordering::SeqCst) {
            return Err(Error::Runtime(HResult::E_FAIL));
        }
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.installed
            .lock()
            .unwrap()
            .insert((module, method), body.to_vec());
        Ok(())
    }
}

/// The runtime's hosting interface.
pub struct FakeRuntime {
    version: String,
    info: Arc<FakeProfilerInfo>,
    refuse_registration: bool,
    callback: Mutex<Option<Arc<dyn ProfilerCallback>>>,
    events: Mutex<Option<EventMask>>,
    unregistrations: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(version: &str, info: Arc<FakeProfilerInfo>) -> Self {
        FakeRuntime {
            version: version.to_string(),
            info,
            refuse_registration: false,
            callback: Mutex::new(None),
            events: Mutex::new(None),
            unregistrations: AtomicUsize::new(0),
        }
    }

    pub fn refusing_registration(mut self) -> Self {
        self.refuse_registration = true;
        self
    }

    /// The registered callback; panics when nothing is registered.
    pub fn callback(&self) -> Arc<dyn ProfilerCallback> {
        self.callback
            .lock()
            .unwrap()
            .clone()
            .expect("no callback registered")
    }

    pub fn is_registered(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    pub fn events(&self) -> Option<EventMask> {
        *self.events.lock().unwrap()
    }

    pub fn unregistrations(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }
}

impl RuntimeHost for FakeRuntime {
    fn runtime_info(&self) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            version: self.version.clone(),
        })
    }

    fn register_callback(
        &self,
        callback: Arc<dyn ProfilerCallback>,
        events: EventMask,
    ) -> Result<()> {
        if self.refuse_registration {
            return Err(Error::Runtime(HResult::E_FAIL));
        }
        *self.callback.lock().unwrap() = Some(callback);
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    fn unregister_callback(&self) -> Result<()> {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        self.callback.lock().unwrap().take();
        Ok(())
    }

    fn profiler_info(&self) -> Result<Arc<dyn ProfilerInfo>> {
        let info: Arc<dyn ProfilerInfo> = self.info.clone();
        Ok(info)
    }
}

/// The helper every test rule calls.
pub fn tracer() -> HelperRef {
    HelperRef::new("Dotweave.Helpers", "Dotweave.Helpers.MethodTracer")
}
