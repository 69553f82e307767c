//! Sandbox execution context
//!
//! One [`SandboxExecutionContext`] owns the wasmtime engine, the host import
//! linker and the epoch ticker. [`SandboxExecutionContext::run`] loads a
//! code unit into a fresh store: per-unit proxy arena, intercepting loader
//! and global scope, then top-level code under the load budget. A unit
//! either comes back fully loaded or not at all.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use warden_api::{CodeHash, EXPORT_INITIALIZE, RESERVED_EXPORTS};
use wasmtime::{
    Config, Engine, Func, FuncType, Instance, Linker, Module, Store, StoreContextMut, Trap,
    UpdateDeadline,
};

use super::error::SandboxError;
use super::globals::GlobalScope;
use super::handles::HandleTable;
use super::{abi, CodeUnit};
use crate::classifier::CapabilityClassifier;
use crate::config::{ExecutionLimits, HostConfig};
use crate::loader::InterceptingLoader;
use crate::modules::HostModules;
use crate::proxy::CapabilityProxy;
use crate::trust::{take_consent_wait, TrustBroker};
use crate::value::HostError;

/// Raised from the epoch callback once the wall-clock deadline has passed
#[derive(Debug, Error)]
#[error("execution budget exceeded")]
pub struct BudgetExceeded;

/// Ticks between deadline checks while no budget is armed
const IDLE_TICKS: u64 = 100;

/// Store data for one loaded unit
pub struct UnitState {
    pub(crate) unit_id: String,
    pub(crate) loader: InterceptingLoader,
    pub(crate) globals: GlobalScope,
    pub(crate) handles: HandleTable,
    pub(crate) last_error: Option<HostError>,
    pub(crate) deadline: Option<Instant>,
}

impl UnitState {
    pub fn proxy(&self) -> &Arc<CapabilityProxy> {
        self.loader.proxy()
    }

    pub fn globals(&self) -> &GlobalScope {
        &self.globals
    }
}

/// Background thread advancing the engine epoch
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, tick: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("warden-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Loads code units into isolated wasm instances
pub struct SandboxExecutionContext {
    engine: Engine,
    linker: Linker<UnitState>,
    limits: ExecutionLimits,
    broker: Arc<TrustBroker>,
    classifier: Arc<CapabilityClassifier>,
    modules: Arc<HostModules>,
    env: Vec<(String, String)>,
    _ticker: EpochTicker,
}

impl SandboxExecutionContext {
    pub fn new(broker: Arc<TrustBroker>, config: &HostConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        let env = config.allowed_env()?;
        let limits = config.limits;

        let mut wasm = Config::new();
        wasm.epoch_interruption(true);
        wasm.max_wasm_stack(limits.max_wasm_stack);
        if limits.fuel.is_some() {
            wasm.consume_fuel(true);
        }
        let engine = Engine::new(&wasm).map_err(SandboxError::Engine)?;

        let mut linker = Linker::new(&engine);
        abi::link(&mut linker).map_err(SandboxError::Engine)?;

        let ticker = EpochTicker::start(engine.clone(), limits.epoch_tick)
            .map_err(|e| SandboxError::Engine(e.into()))?;

        tracing::debug!(
            load_timeout = ?limits.load_timeout,
            invoke_timeout = ?limits.invoke_timeout,
            fuel = ?limits.fuel,
            "Sandbox execution context ready"
        );

        Ok(Self {
            engine,
            linker,
            limits,
            broker,
            classifier: Arc::new(CapabilityClassifier::new(config.danger_table.clone())),
            modules: Arc::new(HostModules::builtin(config.resources_dir.clone())),
            env,
            _ticker: ticker,
        })
    }

    /// Use a custom module registry instead of the stock one
    pub fn with_modules(mut self, modules: Arc<HostModules>) -> Self {
        self.modules = modules;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub fn broker(&self) -> &Arc<TrustBroker> {
        &self.broker
    }

    pub fn classifier(&self) -> &Arc<CapabilityClassifier> {
        &self.classifier
    }

    pub fn modules(&self) -> &Arc<HostModules> {
        &self.modules
    }

    /// Compile, instantiate and run the unit's top-level code
    pub fn run(&self, unit: &CodeUnit) -> Result<LoadedUnit, SandboxError> {
        let module = Module::new(&self.engine, &unit.source).map_err(SandboxError::Compile)?;

        let proxy = CapabilityProxy::new(&unit.id, unit.code_hash.clone(), self.broker.clone());
        let loader = InterceptingLoader::new(self.classifier.clone(), self.modules.clone(), proxy);
        let globals = GlobalScope::build(&loader, &self.env);

        let mut store = Store::new(
            &self.engine,
            UnitState {
                unit_id: unit.id.clone(),
                loader,
                globals,
                handles: HandleTable::new(),
                last_error: None,
                deadline: None,
            },
        );
        let limits = self.limits;
        store.epoch_deadline_callback(move |ctx: StoreContextMut<'_, UnitState>| match ctx.data().deadline {
            None => Ok(UpdateDeadline::Continue(IDLE_TICKS)),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(anyhow::Error::new(BudgetExceeded))
                } else {
                    Ok(UpdateDeadline::Continue(limits.ticks_for(deadline - now)))
                }
            }
        });

        let budget = self.limits.load_timeout;
        let loaded: Result<(Instance, BTreeMap<String, FuncType>), SandboxError> = (|| {
            arm(&mut store, &self.limits, Some(budget))?;

            let instance = self
                .linker
                .instantiate(&mut store, &module)
                .map_err(|e| instantiate_error(e, budget))?;

            if let Some(init) = instance.get_func(&mut store, EXPORT_INITIALIZE) {
                let init = init
                    .typed::<(), ()>(&store)
                    .map_err(SandboxError::Instantiate)?;
                init.call(&mut store, ())
                    .map_err(|e| SandboxError::from_call(e, budget))?;
            }

            let exports = collect_exports(&mut store, &instance);
            disarm(&mut store);
            Ok((instance, exports))
        })();

        match loaded {
            Ok((instance, exports)) => {
                tracing::info!(
                    unit = %unit.id,
                    hash = %unit.code_hash,
                    exports = exports.len(),
                    "Unit loaded"
                );
                Ok(LoadedUnit {
                    unit: unit.clone(),
                    store,
                    instance,
                    exports,
                    limits: self.limits,
                })
            }
            Err(error) => {
                store.data().globals.abort();
                tracing::warn!(unit = %unit.id, error = %error, "Unit failed to load");
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for SandboxExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutionContext")
            .field("limits", &self.limits)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

/// Link failures are configuration errors; anything raised while running
/// the start function is classified like any other call
fn instantiate_error(error: anyhow::Error, budget: Duration) -> SandboxError {
    let raised = error.is::<HostError>() || error.is::<Trap>() || error.is::<BudgetExceeded>();
    if raised {
        SandboxError::from_call(error, budget)
    } else {
        SandboxError::Instantiate(error)
    }
}

fn collect_exports(store: &mut Store<UnitState>, instance: &Instance) -> BTreeMap<String, FuncType> {
    let funcs: Vec<(String, Func)> = instance
        .exports(&mut *store)
        .filter_map(|export| {
            let name = export.name().to_string();
            export.into_func().map(|func| (name, func))
        })
        .collect();

    funcs
        .into_iter()
        .filter(|(name, _)| !RESERVED_EXPORTS.contains(&name.as_str()))
        .map(|(name, func)| {
            let ty = func.ty(&*store);
            (name, ty)
        })
        .collect()
}

/// Start a budget for the next call into the unit
fn arm(
    store: &mut Store<UnitState>,
    limits: &ExecutionLimits,
    budget: Option<Duration>,
) -> Result<(), SandboxError> {
    // Waits recorded by earlier host calls on this thread belong to them
    let _ = take_consent_wait();

    store.data_mut().deadline = budget.map(|budget| Instant::now() + budget);
    store.set_epoch_deadline(budget.map_or(IDLE_TICKS, |budget| limits.ticks_for(budget)));
    if let Some(fuel) = limits.fuel {
        store.set_fuel(fuel).map_err(SandboxError::Engine)?;
    }
    Ok(())
}

fn disarm(store: &mut Store<UnitState>) {
    store.data_mut().deadline = None;
}

/// A unit whose top-level code completed
pub struct LoadedUnit {
    unit: CodeUnit,
    store: Store<UnitState>,
    instance: Instance,
    exports: BTreeMap<String, FuncType>,
    limits: ExecutionLimits,
}

impl LoadedUnit {
    pub fn id(&self) -> &str {
        &self.unit.id
    }

    pub fn code_hash(&self) -> &CodeHash {
        &self.unit.code_hash
    }

    pub fn unit(&self) -> &CodeUnit {
        &self.unit
    }

    /// Names of the invocable exports
    pub fn exports(&self) -> Vec<String> {
        self.exports.keys().cloned().collect()
    }

    pub fn export_type(&self, name: &str) -> Option<&FuncType> {
        self.exports.get(name)
    }

    pub fn proxy(&self) -> &Arc<CapabilityProxy> {
        self.store.data().proxy()
    }

    pub fn state(&self) -> &UnitState {
        self.store.data()
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    pub(crate) fn instance(&self) -> Instance {
        self.instance
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store<UnitState> {
        &mut self.store
    }

    /// Arm a fresh budget; `None` leaves the call unbounded
    pub(crate) fn arm(&mut self, budget: Option<Duration>) -> Result<(), SandboxError> {
        arm(&mut self.store, &self.limits, budget)
    }

    pub(crate) fn disarm(&mut self) {
        disarm(&mut self.store);
        let state = self.store.data_mut();
        state.last_error = None;
    }

    /// Abort the unit's signal and release everything it holds
    pub fn shutdown(&mut self) {
        let state = self.store.data_mut();
        state.globals.abort();
        state.handles = HandleTable::new();
        state.last_error = None;
        tracing::debug!(unit = %self.unit.id, "Unit shut down");
    }
}

impl std::fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("id", &self.unit.id)
            .field("code_hash", &self.unit.code_hash)
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}
