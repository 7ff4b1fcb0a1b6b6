#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{ContextData, Step, StepContext, StepError, StepOutcome, StepSpec, Value};
use flowruntime::{HostConfig, StepFactory, StepRegistry, WorkflowHost};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(5);

/// Labels recorded by test steps, in completion order
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Sleeps for `ms`, then records `label`. Tracks how many run at once.
#[derive(Clone)]
pub struct SleepStep {
    log: Log,
    active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for SleepStep {
    fn step_type(&self) -> &str {
        "sleep"
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let ms = ctx.require_input("ms")?.as_i64().unwrap_or(0) as u64;
        let label = ctx.require_str("label")?.to_string();

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.log.push(label);
        if let Some(Value::String(key)) = ctx.inputs.get("key").cloned() {
            let value = ctx.input_or("value", Value::Null);
            ctx.set(key, value);
        }
        Ok(StepOutcome::Next)
    }
}

impl StepFactory for SleepStep {
    fn create(&self) -> Result<Box<dyn Step>, StepError> {
        Ok(Box::new(self.clone()))
    }

    fn step_type(&self) -> &str {
        "sleep"
    }
}

/// Registry with the test steps:
///
/// * `record` pushes `label`
/// * `write` sets context field `key` to `value`, then pushes `label`
/// * `peek` pushes `label=<context[key]>` or `label=none`
/// * `fail` faults with `label`
/// * `wait` suspends on `token`, storing the payload under `output`
/// * `sleep` waits `ms` milliseconds, then behaves like `write`
pub fn registry(log: &Log) -> (StepRegistry, Arc<AtomicUsize>) {
    let mut registry = StepRegistry::new();

    let l = log.clone();
    registry.register_fn("record", move |ctx| {
        l.push(ctx.require_str("label")?);
        Ok(StepOutcome::Next)
    });

    let l = log.clone();
    registry.register_fn("write", move |ctx| {
        let key = ctx.require_str("key")?.to_string();
        let value = ctx.require_input("value")?.clone();
        ctx.set(key, value);
        if let Some(label) = ctx.inputs.get("label").and_then(Value::as_str) {
            l.push(label);
        }
        Ok(StepOutcome::Next)
    });

    let l = log.clone();
    registry.register_fn("peek", move |ctx| {
        let label = ctx.require_str("label")?;
        let key = ctx.require_str("key")?;
        let seen = ctx
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "none".to_string());
        l.push(format!("{}={}", label, seen));
        Ok(StepOutcome::Next)
    });

    registry.register_fn("fail", |ctx| {
        let label = ctx.require_str("label")?;
        Err(StepError::ExecutionFailed(label.to_string()))
    });

    registry.register_fn("wait", |ctx| {
        let token = ctx.require_str("token")?.to_string();
        let output = ctx
            .inputs
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or("payload")
            .to_string();
        Ok(StepOutcome::suspend_into(token, output))
    });

    let peak = Arc::new(AtomicUsize::new(0));
    registry.register(Arc::new(SleepStep {
        log: log.clone(),
        active: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
    }));

    (registry, peak)
}

pub fn record(label: &str) -> StepSpec {
    StepSpec::new("record").named(label).input("label", label)
}

pub fn write(key: &str, value: impl Into<Value>) -> StepSpec {
    StepSpec::new("write")
        .named(format!("write {}", key))
        .input("key", key)
        .input("value", value)
}

pub fn peek(label: &str, key: &str) -> StepSpec {
    StepSpec::new("peek")
        .named(label)
        .input("label", label)
        .input("key", key)
}

pub fn fail(label: &str) -> StepSpec {
    StepSpec::new("fail").named(label).input("label", label)
}

pub fn wait(token: &str, output: &str) -> StepSpec {
    StepSpec::new("wait")
        .named(format!("wait {}", token))
        .input("token", token)
        .input("output", output)
}

pub fn sleep(label: &str, ms: i64) -> StepSpec {
    StepSpec::new("sleep")
        .named(label)
        .input("label", label)
        .input("ms", ms)
}

pub fn input(pairs: &[(&str, Value)]) -> ContextData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// A started host with the test registry
pub async fn started_host(registry: StepRegistry, config: HostConfig) -> WorkflowHost {
    init_tracing();
    let host = WorkflowHost::with_registry(Arc::new(registry), config);
    host.start().await.unwrap();
    host
}
