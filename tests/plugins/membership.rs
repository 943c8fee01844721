use charter::core::address::Address;
use charter::core::config::CharterConfig;
use charter::core::error::{CharterError, Reason};
use charter::core::kernel::Instance;
use charter::core::registry::{CreateInstance, Registry};
use charter::core::store::Store;
use charter::plugins::catalog::builtin_catalog;
use charter::plugins::membership::Role;
use serde_json::{Value, json};
use tempfile::tempdir;

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

fn test_instance() -> (tempfile::TempDir, Instance) {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    let (_record, instance) = registry
        .create_instance(
            &builtin_catalog(),
            &CharterConfig::default(),
            CreateInstance {
                name: "guild".into(),
                description: String::new(),
                visibility: None,
                label: "test".into(),
                creator: addr("factory"),
                modules: vec!["membership".into()],
                init_payloads: vec![json!({"admin": "alice"})],
            },
        )
        .unwrap();
    (tmp, instance)
}

fn call(instance: &Instance, op: &str, caller: &str, payload: Value) -> Result<Value, CharterError> {
    instance.call(op, &payload, &addr(caller)).map(|r| r.result)
}

fn role_of(instance: &Instance, who: &str) -> Role {
    let v = call(instance, "get_role", "anyone", json!({ "address": who })).unwrap();
    Role::from_value(&v).unwrap()
}

fn join_as(instance: &Instance, who: &str, role: &str) {
    call(instance, "request_to_join", who, Value::Null).unwrap();
    call(
        instance,
        "accept_request",
        "alice",
        json!({ "requester": who, "role": role }),
    )
    .unwrap();
}

#[test]
fn init_grants_admin_and_lists_creator() {
    let (_tmp, instance) = test_instance();
    assert_eq!(role_of(&instance, "alice"), Role::Admin);
    assert_eq!(role_of(&instance, "nobody"), Role::None);
    assert_eq!(call(&instance, "get_members", "x", Value::Null).unwrap(), json!(["alice"]));
    assert_eq!(call(&instance, "get_member_count", "x", Value::Null).unwrap(), json!(1));
}

#[test]
fn scenario_accept_request() {
    let (_tmp, instance) = test_instance();
    call(&instance, "request_to_join", "bob", Value::Null).unwrap();
    assert_eq!(call(&instance, "get_join_requests", "x", Value::Null).unwrap(), json!(["bob"]));

    call(
        &instance,
        "accept_request",
        "alice",
        json!({ "requester": "bob", "role": "Member" }),
    )
    .unwrap();

    assert_eq!(role_of(&instance, "bob"), Role::Member);
    assert_eq!(call(&instance, "get_member_count", "x", Value::Null).unwrap(), json!(2));
    assert_eq!(call(&instance, "get_join_requests", "x", Value::Null).unwrap(), json!([]));
}

#[test]
fn scenario_reject_request_allows_rerequest() {
    let (_tmp, instance) = test_instance();
    call(&instance, "request_to_join", "frank", Value::Null).unwrap();
    call(&instance, "reject_request", "alice", json!({ "requester": "frank" })).unwrap();

    assert_eq!(role_of(&instance, "frank"), Role::None);
    assert_eq!(call(&instance, "get_join_requests", "x", Value::Null).unwrap(), json!([]));
    assert_eq!(
        call(&instance, "has_pending_request", "x", json!({ "address": "frank" })).unwrap(),
        json!(false)
    );

    call(&instance, "request_to_join", "frank", Value::Null).unwrap();
    assert_eq!(call(&instance, "get_join_requests", "x", Value::Null).unwrap(), json!(["frank"]));
}

#[test]
fn request_to_join_is_not_idempotent() {
    let (_tmp, instance) = test_instance();
    call(&instance, "request_to_join", "bob", Value::Null).unwrap();
    let err = call(&instance, "request_to_join", "bob", Value::Null).unwrap_err();
    assert!(matches!(err, CharterError::StateError(Reason::AlreadyRequested)));

    let err = call(&instance, "request_to_join", "alice", Value::Null).unwrap_err();
    assert!(matches!(err, CharterError::StateError(Reason::AlreadyMember)));
}

#[test]
fn non_admin_cannot_change_roles() {
    let (_tmp, instance) = test_instance();
    join_as(&instance, "bob", "member");
    call(&instance, "request_to_join", "carol", Value::Null).unwrap();

    let attempts = [
        ("accept_request", json!({ "requester": "carol", "role": "member" })),
        ("reject_request", json!({ "requester": "carol" })),
        ("remove_member", json!({ "member": "alice" })),
        ("change_role", json!({ "member": "bob", "role": "admin" })),
    ];
    for caller in ["bob", "carol", "stranger"] {
        for (op, payload) in &attempts {
            let err = call(&instance, op, caller, payload.clone()).unwrap_err();
            assert!(
                matches!(err, CharterError::AuthorizationError(Reason::OnlyAdmin)),
                "{} by {} gave {}",
                op,
                caller,
                err
            );
        }
    }
    assert_eq!(role_of(&instance, "bob"), Role::Member);
    assert_eq!(role_of(&instance, "carol"), Role::None);
}

#[test]
fn accept_requires_pending_request_and_valid_role() {
    let (_tmp, instance) = test_instance();
    let err = call(
        &instance,
        "accept_request",
        "alice",
        json!({ "requester": "ghost", "role": "member" }),
    )
    .unwrap_err();
    assert!(matches!(err, CharterError::NotFound(Reason::NoRequest)));

    let err = call(&instance, "reject_request", "alice", json!({ "requester": "ghost" })).unwrap_err();
    assert_eq!(err.code(), "no_request");

    call(&instance, "request_to_join", "bob", Value::Null).unwrap();
    for bad in [json!("none"), json!(0), json!("owner"), json!(7)] {
        let err = call(
            &instance,
            "accept_request",
            "alice",
            json!({ "requester": "bob", "role": bad }),
        )
        .unwrap_err();
        assert!(matches!(err, CharterError::ValidationError(Reason::InvalidRole)));
    }
    // The request survives failed accepts.
    assert_eq!(call(&instance, "get_join_requests", "x", Value::Null).unwrap(), json!(["bob"]));
}

#[test]
fn remove_member_swap_removes_listing() {
    let (_tmp, instance) = test_instance();
    join_as(&instance, "bob", "member");
    join_as(&instance, "carol", "member");
    join_as(&instance, "dave", "admin");

    call(&instance, "remove_member", "alice", json!({ "member": "bob" })).unwrap();
    assert_eq!(role_of(&instance, "bob"), Role::None);
    assert_eq!(
        call(&instance, "get_members", "x", Value::Null).unwrap(),
        json!(["alice", "dave", "carol"])
    );

    let err = call(&instance, "remove_member", "alice", json!({ "member": "bob" })).unwrap_err();
    assert!(matches!(err, CharterError::StateError(Reason::NotMember)));
}

#[test]
fn readding_a_removed_member_appends_a_new_entry() {
    let (_tmp, instance) = test_instance();
    join_as(&instance, "bob", "member");
    call(&instance, "remove_member", "alice", json!({ "member": "bob" })).unwrap();
    join_as(&instance, "bob", "member");
    assert_eq!(call(&instance, "get_members", "x", Value::Null).unwrap(), json!(["alice", "bob"]));
    assert_eq!(call(&instance, "get_member_count", "x", Value::Null).unwrap(), json!(2));
}

#[test]
fn change_role_promotes_and_validates() {
    let (_tmp, instance) = test_instance();
    join_as(&instance, "bob", "member");

    call(&instance, "change_role", "alice", json!({ "member": "bob", "role": "admin" })).unwrap();
    assert_eq!(role_of(&instance, "bob"), Role::Admin);

    // Bob can now administer.
    call(&instance, "request_to_join", "carol", Value::Null).unwrap();
    call(&instance, "accept_request", "bob", json!({ "requester": "carol", "role": 1 })).unwrap();
    assert_eq!(role_of(&instance, "carol"), Role::Member);

    let err = call(&instance, "change_role", "alice", json!({ "member": "ghost", "role": "member" })).unwrap_err();
    assert_eq!(err.code(), "not_member");
    let err = call(&instance, "change_role", "alice", json!({ "member": "bob", "role": "none" })).unwrap_err();
    assert_eq!(err.code(), "invalid_role");
    assert_eq!(role_of(&instance, "bob"), Role::Admin);
}

#[test]
fn malformed_payload_is_validation_error() {
    let (_tmp, instance) = test_instance();
    let err = call(&instance, "remove_member", "alice", json!({ "who": "bob" })).unwrap_err();
    assert_eq!(err.category(), "validation");
    assert_eq!(err.code(), "malformed_payload");
}

#[test]
fn notifications_are_reported_on_receipts() {
    let (_tmp, instance) = test_instance();
    let receipt = instance
        .call("request_to_join", &Value::Null, &addr("bob"))
        .unwrap();
    assert_eq!(receipt.notifications.len(), 1);
    assert_eq!(receipt.notifications[0].name, "join_requested");
    assert_eq!(receipt.notifications[0].data["address"], "bob");
}
