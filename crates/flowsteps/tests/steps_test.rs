use flowcore::{EventBus, ExecutionEvent, InstanceId, Step, StepContext, StepError, StepEvent, StepOutcome, Value};
use flowruntime::StepRegistry;
use flowsteps::{DelayStep, LogContextStep, PrintMessageStep, WaitForEventStep};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

// Helper function to create a test context
fn create_test_context(bus: &EventBus, inputs: HashMap<String, Value>) -> StepContext {
    let instance_id = InstanceId::new_v4();
    StepContext::new(
        instance_id,
        "test-step",
        inputs,
        Default::default(),
        bus.create_emitter(instance_id, "test-step"),
    )
}

fn info_messages(rx: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ExecutionEvent::StepEvent {
            event: StepEvent::Info { message },
            ..
        } = event
        {
            messages.push(message);
        }
    }
    messages
}

#[test]
fn test_register_all_lists_every_step() {
    let mut registry = StepRegistry::new();
    flowsteps::register_all(&mut registry);

    assert_eq!(
        registry.list_step_types(),
        vec![
            "event.wait",
            "log.context",
            "print.message",
            "say.goodbye",
            "say.hello",
            "time.delay",
        ]
    );

    let metadata = registry.get_metadata("print.message").unwrap();
    assert_eq!(metadata.category, "print");
    assert!(metadata.inputs.iter().any(|p| p.name == "message" && p.required));
}

#[tokio::test]
async fn test_print_message_emits_its_input() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let inputs = HashMap::from([("message".to_string(), Value::from("Item 1.1"))]);
    let mut ctx = create_test_context(&bus, inputs);

    let outcome = PrintMessageStep.run(&mut ctx).await.unwrap();

    assert_eq!(outcome, StepOutcome::Next);
    assert_eq!(info_messages(&mut rx), vec!["Item 1.1".to_string()]);
    assert!(ctx.writes().is_empty());
}

#[tokio::test]
async fn test_print_message_requires_message() {
    let bus = EventBus::new(16);
    let mut ctx = create_test_context(&bus, HashMap::new());

    let result = PrintMessageStep.run(&mut ctx).await;

    assert_eq!(result, Err(StepError::MissingInput("message".to_string())));
}

#[tokio::test]
async fn test_delay_waits_for_configured_time() {
    let bus = EventBus::new(16);
    let inputs = HashMap::from([("delay_ms".to_string(), Value::from(30))]);
    let mut ctx = create_test_context(&bus, inputs);

    let started = Instant::now();
    let outcome = DelayStep.run(&mut ctx).await.unwrap();

    assert_eq!(outcome, StepOutcome::Next);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_delay_rejects_negative_values() {
    let bus = EventBus::new(16);
    let inputs = HashMap::from([("delay_ms".to_string(), Value::from(-5))]);
    let mut ctx = create_test_context(&bus, inputs);

    let result = DelayStep.run(&mut ctx).await;

    assert!(matches!(result, Err(StepError::InvalidInputType { .. })));
}

#[tokio::test]
async fn test_delay_stops_on_cancellation() {
    let bus = EventBus::new(16);
    let inputs = HashMap::from([("delay_ms".to_string(), Value::from(60_000))]);
    let mut ctx = create_test_context(&bus, inputs);
    ctx.cancellation.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), DelayStep.run(&mut ctx))
        .await
        .expect("delay should observe cancellation");

    assert_eq!(result, Err(StepError::Cancelled));
}

#[tokio::test]
async fn test_delay_warns_when_falling_back_to_default() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let mut ctx = create_test_context(&bus, HashMap::new());
    ctx.cancellation.cancel();

    let result = DelayStep.run(&mut ctx).await;
    assert_eq!(result, Err(StepError::Cancelled));

    let warning = match rx.try_recv().unwrap() {
        ExecutionEvent::StepEvent {
            event: StepEvent::Warning { message },
            ..
        } => message,
        other => panic!("unexpected event: {:?}", other),
    };
    assert_eq!(warning, "delay_ms not set, using 1000ms");
}

#[tokio::test]
async fn test_wait_for_event_suspends_on_token() {
    let bus = EventBus::new(16);
    let inputs = HashMap::from([
        ("event_name".to_string(), Value::from("approval")),
        ("event_key".to_string(), Value::from("order-7")),
        ("output".to_string(), Value::from("decision")),
    ]);
    let mut rx = bus.subscribe();
    let mut ctx = create_test_context(&bus, inputs);

    let outcome = WaitForEventStep.run(&mut ctx).await.unwrap();

    assert_eq!(outcome, StepOutcome::suspend_into("approval:order-7", "decision"));
    let published = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|event| match event {
        ExecutionEvent::StepEvent {
            event: StepEvent::Data { key, value },
            ..
        } => Some((key, value)),
        _ => None,
    });
    assert_eq!(
        published,
        Some(("resume_token".to_string(), Value::from("approval:order-7")))
    );
}

#[tokio::test]
async fn test_wait_for_event_defaults_output_field() {
    let bus = EventBus::new(16);
    let inputs = HashMap::from([("event_name".to_string(), Value::from("approval"))]);
    let mut ctx = create_test_context(&bus, inputs);

    let outcome = WaitForEventStep.run(&mut ctx).await.unwrap();

    assert_eq!(outcome, StepOutcome::suspend_into("approval", "event_data"));
}

#[tokio::test]
async fn test_log_context_reports_fields() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let mut ctx = create_test_context(&bus, HashMap::new());
    ctx.data.insert("approved".to_string(), Value::from(true));

    LogContextStep.run(&mut ctx).await.unwrap();

    let messages = info_messages(&mut rx);
    assert_eq!(messages[0], "DEBUG: 1 context field(s)");
    assert!(messages.contains(&"  approved: true".to_string()));
}
