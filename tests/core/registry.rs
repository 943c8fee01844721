use charter::core::address::Address;
use charter::core::broker::{AuditEntry, DbBroker};
use charter::core::config::{CharterConfig, OperationConflicts};
use charter::core::error::{CharterError, Reason};
use charter::core::registry::{CreateInstance, InstanceFilter, Registry, Visibility};
use charter::core::store::Store;
use charter::plugins::catalog::builtin_catalog;
use serde_json::{Value, json};
use std::fs;
use tempfile::tempdir;

fn addr(s: &str) -> Address {
    Address::new(s).unwrap()
}

fn request(name: &str, creator: &str, visibility: Option<Visibility>, label: &str) -> CreateInstance {
    CreateInstance {
        name: name.into(),
        description: format!("{} description", name),
        visibility,
        label: label.into(),
        creator: addr(creator),
        modules: vec!["membership".into(), "claims".into()],
        init_payloads: vec![json!({ "admin": creator }), json!({ "quorum": 2 })],
    }
}

fn instance_files(store: &Store) -> usize {
    fs::read_dir(store.root.join("instances"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == "db"))
        .count()
}

#[test]
fn create_records_metadata_and_initializes() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();

    let (record, instance) = registry
        .create_instance(
            &builtin_catalog(),
            &CharterConfig::default(),
            request("guild", "alice", Some(Visibility::Private), "coop"),
        )
        .unwrap();

    assert_eq!(record.index, 0);
    assert_eq!(record.name, "guild");
    assert_eq!(record.visibility, Visibility::Private);
    assert_eq!(record.modules, vec!["membership", "claims"]);
    assert_eq!(record.creator, addr("alice"));
    assert!(instance.is_initialized());
    assert_eq!(instance.id(), record.id);

    let fetched = registry.get(&record.id).unwrap();
    assert_eq!(fetched, record);
    assert_eq!(registry.by_index(0).unwrap().id, record.id);

    let reopened = registry.open_instance(&record.id, &builtin_catalog()).unwrap();
    let role = reopened
        .call("get_role", &json!({ "address": "alice" }), &addr("x"))
        .unwrap();
    assert_eq!(role.result, json!("admin"));
}

#[test]
fn creation_notification_carries_instance_modules_and_visibility() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    let (record, _) = registry
        .create_instance(
            &builtin_catalog(),
            &CharterConfig::default(),
            request("guild", "alice", None, ""),
        )
        .unwrap();

    let log = DbBroker::new(&store.audit_log_path()).read_audit_log().unwrap();
    let created = log
        .iter()
        .find_map(|e| match e {
            AuditEntry::Notification(n) if n.name == "instance_created" => Some(n),
            _ => None,
        })
        .expect("instance_created notification");
    assert_eq!(created.instance, record.id);
    assert_eq!(created.data["modules"], json!(["membership", "claims"]));
    assert_eq!(created.data["visibility"], "public");
}

#[test]
fn default_visibility_comes_from_config() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    let config = CharterConfig::parse("[registry]\ndefault_visibility = \"private\"\n").unwrap();

    let (record, _) = registry
        .create_instance(&builtin_catalog(), &config, request("quiet", "bob", None, ""))
        .unwrap();
    assert_eq!(record.visibility, Visibility::Private);
}

#[test]
fn failed_creation_leaves_no_trace() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    let catalog = builtin_catalog();
    let config = CharterConfig::default();

    let mut bad_payload = request("bad", "alice", None, "");
    bad_payload.init_payloads[0] = json!({ "administrator": "alice" });
    let err = registry.create_instance(&catalog, &config, bad_payload).err().unwrap();
    assert_eq!(err.code(), "malformed_payload");

    let mut empty = request("empty", "alice", None, "");
    empty.modules.clear();
    empty.init_payloads.clear();
    let err = registry.create_instance(&catalog, &config, empty).err().unwrap();
    assert!(matches!(err, CharterError::ValidationError(Reason::EmptyModuleList)));

    let mut mismatched = request("mismatch", "alice", None, "");
    mismatched.init_payloads.push(Value::Null);
    let err = registry.create_instance(&catalog, &config, mismatched).err().unwrap();
    assert_eq!(err.code(), "payload_count_mismatch");

    let mut unknown = request("unknown", "alice", None, "");
    unknown.modules[1] = "greeting".into();
    let err = registry.create_instance(&catalog, &config, unknown).err().unwrap();
    assert_eq!(err.code(), "unknown_module");

    assert_eq!(registry.count().unwrap(), 0);
    assert_eq!(instance_files(&store), 0);
}

#[test]
fn filters_by_visibility_creator_and_label() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    let catalog = builtin_catalog();
    let config = CharterConfig::default();

    for (name, creator, vis, label) in [
        ("a", "alice", Visibility::Public, "coop"),
        ("b", "alice", Visibility::Private, "coop"),
        ("c", "bob", Visibility::Public, "fund"),
    ] {
        registry
            .create_instance(&catalog, &config, request(name, creator, Some(vis), label))
            .unwrap();
    }
    assert_eq!(registry.count().unwrap(), 3);

    let names = |filter: InstanceFilter| -> Vec<String> {
        registry
            .list(&filter)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect()
    };
    assert_eq!(names(InstanceFilter::default()), vec!["a", "b", "c"]);
    assert_eq!(
        names(InstanceFilter {
            visibility: Some(Visibility::Public),
            ..Default::default()
        }),
        vec!["a", "c"]
    );
    assert_eq!(
        names(InstanceFilter {
            creator: Some(addr("alice")),
            ..Default::default()
        }),
        vec!["a", "b"]
    );
    assert_eq!(
        names(InstanceFilter {
            label: Some("coop".into()),
            visibility: Some(Visibility::Private),
            ..Default::default()
        }),
        vec!["b"]
    );
    assert_eq!(registry.by_index(2).unwrap().name, "c");
    assert_eq!(registry.by_index(3).err().unwrap().code(), "unknown_instance");
}

#[test]
fn index_beyond_sqlite_range_is_not_found() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    registry
        .create_instance(
            &builtin_catalog(),
            &CharterConfig::default(),
            request("only", "alice", None, ""),
        )
        .unwrap();

    for index in [u64::MAX, i64::MAX as u64 + 1] {
        let err = registry.by_index(index).err().unwrap();
        assert!(matches!(err, CharterError::NotFound(Reason::UnknownInstance(_))));
    }
}

#[test]
fn creation_that_cannot_be_audited_leaves_no_trace() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    fs::create_dir(store.audit_log_path()).unwrap();

    let err = registry
        .create_instance(
            &builtin_catalog(),
            &CharterConfig::default(),
            request("unlogged", "alice", None, ""),
        )
        .err()
        .unwrap();
    assert!(matches!(err, CharterError::IoError(_)));
    assert_eq!(registry.count().unwrap(), 0);
    assert_eq!(instance_files(&store), 0);
}

#[test]
fn init_notifications_are_recorded_with_instance_created() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    let (record, _) = registry
        .create_instance(
            &builtin_catalog(),
            &CharterConfig::default(),
            request("guild", "alice", None, ""),
        )
        .unwrap();

    let log = DbBroker::new(&store.audit_log_path()).read_audit_log().unwrap();
    let names: Vec<&str> = log
        .iter()
        .filter_map(|e| match e {
            AuditEntry::Notification(n) if n.instance == record.id => Some(n.name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["member_added", "instance_created"]);
}

#[test]
fn unknown_instance_lookups_fail() {
    let tmp = tempdir().unwrap();
    let store = Store::open(tmp.path()).unwrap();
    let registry = Registry::open(&store).unwrap();
    assert!(matches!(
        registry.get("missing").unwrap_err(),
        CharterError::NotFound(Reason::UnknownInstance(_))
    ));
    assert!(registry.open_instance("missing", &builtin_catalog()).is_err());
}

#[test]
fn config_file_reject_policy_is_loaded_from_root() {
    let tmp = tempdir().unwrap();
    fs::write(
        tmp.path().join("charter.toml"),
        "[kernel]\noperation_conflicts = \"reject\"\n",
    )
    .unwrap();
    let config = charter::core::config::load_config(tmp.path()).unwrap();
    assert_eq!(config.kernel.operation_conflicts, OperationConflicts::Reject);
}
