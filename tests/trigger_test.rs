//! Trigger engine behavior beyond the headline scenarios: storage and
//! external events, enable/disable, failure isolation.

mod common;

use common::{hash_loop_rule, memory_service, ok_rule, rule};
use enclave_runtime::executor::evaluator::EvalError;
use enclave_runtime::triggers::{Trigger, TriggerKind};

fn trigger(id: &str, kind: TriggerKind, condition: &str, code: &str) -> Trigger {
    Trigger {
        id: id.to_string(),
        kind,
        condition: condition.to_string(),
        function_id: format!("fn-{}", id),
        user_id: "alice".to_string(),
        code: code.to_string(),
        input_json: "{}".to_string(),
        gas_limit: 100_000,
        enabled: true,
        next_execution_time: 0,
        interval_seconds: 60,
    }
}

const OK_CODE: &str = "function main(i){return {ok:true}}";

#[test]
fn test_storage_triggers_fire_unconditionally() {
    let service = memory_service(vec![ok_rule()]);
    service.initialize().unwrap();

    // Conditions on storage triggers are not consulted.
    service
        .register_trigger(trigger("s1", TriggerKind::StorageEvent, "", OK_CODE))
        .unwrap();
    service
        .register_trigger(trigger(
            "s2",
            TriggerKind::StorageEvent,
            r#"{"key":"only-this"}"#,
            OK_CODE,
        ))
        .unwrap();

    assert_eq!(service.process_storage_event("any-key", "put").unwrap(), 2);
    assert_eq!(service.process_storage_event("other", "delete").unwrap(), 2);
}

#[test]
fn test_external_triggers_match_on_event_type() {
    let service = memory_service(vec![ok_rule()]);
    service.initialize().unwrap();

    service
        .register_trigger(trigger("e1", TriggerKind::External, "price-update", OK_CODE))
        .unwrap();
    service
        .register_trigger(trigger("e2", TriggerKind::External, "other-feed", OK_CODE))
        .unwrap();

    assert_eq!(
        service
            .process_external_event("price-update", r#"{"pair":"NEO/USD","price":12}"#)
            .unwrap(),
        1
    );
    assert_eq!(
        service.process_external_event("unknown-feed", "{}").unwrap(),
        0
    );
}

#[test]
fn test_disabled_trigger_is_skipped_until_reenabled() {
    let service = memory_service(vec![ok_rule()]);
    service.initialize().unwrap();
    service
        .register_trigger(trigger("e1", TriggerKind::External, "tick", OK_CODE))
        .unwrap();

    service.disable_trigger("e1").unwrap();
    assert_eq!(service.process_external_event("tick", "{}").unwrap(), 0);

    service.enable_trigger("e1").unwrap();
    assert_eq!(service.process_external_event("tick", "{}").unwrap(), 1);

    assert_eq!(service.enable_trigger("ghost").unwrap_err().kind(), "NotFound");
}

#[test]
fn test_dispatch_input_carries_event_trigger_and_timestamp() {
    // Capture what the executor receives by echoing the input document.
    let service = memory_service(vec![rule("echo input", |_, input, _| {
        Ok(input.to_string())
    })]);
    service.initialize().unwrap();

    let mut registered = trigger(
        "e1",
        TriggerKind::External,
        "tick",
        "function main(input){/* echo input */ return input;}",
    );
    registered.input_json = r#"{"base":"kept"}"#.to_string();
    service.register_trigger(registered).unwrap();

    assert_eq!(
        service
            .process_external_event("tick", r#"{"feed":"price"}"#)
            .unwrap(),
        1
    );
    // The invocation ran under the trigger's function id and settled gas.
    assert!(service.gas_usage("fn-e1") > 0);
}

#[test]
fn test_failing_trigger_does_not_stop_others() {
    let service = memory_service(vec![
        rule("broken routine", |_, _, _| {
            Err(EvalError::Engine("engine fault".to_string()))
        }),
        ok_rule(),
    ]);
    service.initialize().unwrap();

    service
        .register_trigger(trigger(
            "bad",
            TriggerKind::External,
            "tick",
            "function main(){/* broken routine */}",
        ))
        .unwrap();
    service
        .register_trigger(trigger("good", TriggerKind::External, "tick", OK_CODE))
        .unwrap();

    // The evaluator-level failure is not counted; the other fires.
    assert_eq!(service.process_external_event("tick", "{}").unwrap(), 1);
}

#[test]
fn test_gas_exceeded_trigger_does_not_poison_the_next() {
    let service = memory_service(vec![hash_loop_rule(), ok_rule()]);
    service.initialize().unwrap();

    let mut burner = trigger(
        "burner",
        TriggerKind::External,
        "tick",
        "function main(){ while(true) crypto.hash(\"x\"); }",
    );
    burner.gas_limit = 2000;
    service.register_trigger(burner).unwrap();
    service
        .register_trigger(trigger("calm", TriggerKind::External, "tick", OK_CODE))
        .unwrap();

    assert_eq!(service.process_external_event("tick", "{}").unwrap(), 1);
}

#[test]
fn test_bad_condition_logged_and_skipped() {
    let service = memory_service(vec![ok_rule()]);
    service.initialize().unwrap();

    service
        .register_trigger(trigger("broken", TriggerKind::ChainEvent, "not json", OK_CODE))
        .unwrap();
    service
        .register_trigger(trigger("fine", TriggerKind::ChainEvent, "", OK_CODE))
        .unwrap();

    assert_eq!(
        service.process_chain_event(r#"{"type":"transfer"}"#).unwrap(),
        1
    );
}

#[test]
fn test_invalid_registrations_rejected() {
    let service = memory_service(vec![ok_rule()]);
    service.initialize().unwrap();

    let mut missing_code = trigger("x", TriggerKind::External, "tick", "");
    missing_code.code = String::new();
    assert_eq!(
        service.register_trigger(missing_code).unwrap_err().kind(),
        "InvalidArgument"
    );

    let mut zero_interval = trigger("y", TriggerKind::Schedule, "", OK_CODE);
    zero_interval.interval_seconds = 0;
    assert_eq!(
        service.register_trigger(zero_interval).unwrap_err().kind(),
        "InvalidArgument"
    );

    let mut empty_id = trigger("", TriggerKind::External, "tick", OK_CODE);
    empty_id.id = String::new();
    assert_eq!(
        service.register_trigger(empty_id).unwrap_err().kind(),
        "InvalidArgument"
    );
}

#[test]
fn test_schedule_skips_missed_ticks_without_catchup() {
    let service = memory_service(vec![ok_rule()]);
    service.initialize().unwrap();

    let mut scheduled = trigger("s", TriggerKind::Schedule, "", OK_CODE);
    scheduled.next_execution_time = 100;
    scheduled.interval_seconds = 10;
    service.register_trigger(scheduled).unwrap();

    // Three intervals went by; one dispatch, rescheduled from `now`.
    assert_eq!(service.process_scheduled(130).unwrap(), 1);
    assert_eq!(
        service.get_trigger("s").unwrap().unwrap().next_execution_time,
        140
    );
}
