// tests/extension_tests.rs
//! End-to-end tests: classes registered through an `Extension`, constructed
//! and called by the host.

mod test_harness;

use hostbind::prelude::*;
use hostbind_core::{ConfigError, HostInterface};
use hostbind_registry::RegistrationError;
use test_harness::TestHost;

#[derive(Default)]
struct Turret {
    shots: i64,
    target: Option<String>,
}

fn turret_class() -> ClassBuilder<Turret> {
    ClassBuilder::<Turret>::new("Turret")
        .host_base("Node2D")
        .default_constructor()
        .virtual_method("_fire", |turret, ctx| {
            let rounds: i64 = ctx.next_arg()?;
            turret.shots += rounds;
            ctx.set_return(&turret.shots)
        })
        .virtual_method("_aim", |turret, ctx| {
            turret.target = Some(ctx.next_arg()?);
            Ok(())
        })
        .virtual_method("_jam", |_, _| panic!("turret jammed"))
        .virtual_method("_status_line", |turret, ctx| {
            ctx.set_return(&format!("{} shots", turret.shots))?;
            Err(NativeError::other("status unavailable"))
        })
        .virtual_method("_overheat", |_, ctx| {
            ctx.set_return("overheating")?;
            panic!("barrel melted")
        })
}

#[test]
fn classes_reach_the_host_at_their_init_level() {
    let host = TestHost::new();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    assert!(host.stub.registered_class("Turret").is_none());

    host.ext.initialize(InitLevel::Scene).unwrap();
    let class = host.stub.registered_class("Turret").unwrap();
    assert_eq!(class.base, "Node2D");
    assert_eq!(class.flags, ClassFlags::EXPOSED.bits());
    assert!(host.ext.is_initialized(InitLevel::Scene));
}

#[test]
fn host_constructs_and_calls_virtuals() {
    let host = TestHost::new();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();

    let (turret, id) = host.spawn("Turret");
    assert_eq!(host.ext.classes().instance_count(), 1);
    assert_eq!(host.ext.classes().instance_for(turret), Some(id));

    let (status, ret) = host.call_virtual(turret, "_fire", &[3]);
    assert_eq!(status, HostStatus::Ok);
    assert_eq!(ret[0] as i64, 3);
    let (_, ret) = host.call_virtual(turret, "_fire", &[2]);
    assert_eq!(ret[0] as i64, 5);

    // Not overridden: succeeds without touching the return area.
    let (status, ret) = host.call_virtual(turret, "_process", &[]);
    assert_eq!(status, HostStatus::Ok);
    assert_eq!(ret, [0; 3]);

    let name = host.stub.new_string("north gate");
    let (status, _) = host.call_virtual(turret, "_aim", &[name.to_word()]);
    assert_eq!(status, HostStatus::Ok);
    // Arguments stay owned by the host.
    assert_eq!(host.stub.buffer_count(name), Some(1));
    host.stub.api().buffer_unreference(name);

    let state = host
        .ext
        .classes()
        .with_instance(id, |t: &mut Turret| (t.shots, t.target.clone()));
    assert_eq!(state, Some((5, Some("north gate".to_string()))));
    assert_eq!(host.stub.live_buffers(), 0);

    host.stub.api().object_destroy(turret);
    assert_eq!(host.ext.classes().instance_count(), 0);
}

#[test]
fn panics_and_bad_arguments_become_statuses() {
    let host = TestHost::new();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();
    let (turret, _) = host.spawn("Turret");

    let (status, _) = host.call_virtual(turret, "_jam", &[]);
    assert_eq!(status, HostStatus::Bug);

    let (status, _) = host.call_virtual(turret, "_fire", &[]);
    assert_eq!(status, HostStatus::Failed);

    // The instance survives both failures.
    let (status, ret) = host.call_virtual(turret, "_fire", &[1]);
    assert_eq!(status, HostStatus::Ok);
    assert_eq!(ret[0], 1);
    host.stub.api().object_destroy(turret);
}

#[test]
fn failed_calls_hand_nothing_back_to_the_host() {
    let host = TestHost::new();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();
    let (turret, _) = host.spawn("Turret");

    let (status, ret) = host.call_virtual(turret, "_status_line", &[]);
    assert_eq!(status, HostStatus::Failed);
    assert_eq!(ret, [0; 3]);
    assert_eq!(host.stub.live_buffers(), 0);

    let (status, ret) = host.call_virtual(turret, "_overheat", &[]);
    assert_eq!(status, HostStatus::Bug);
    assert_eq!(ret, [0; 3]);
    assert_eq!(host.stub.live_buffers(), 0);

    host.stub.api().object_destroy(turret);
}

#[test]
fn deinitialize_waits_for_live_instances() {
    let host = TestHost::new();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();
    let (turret, _) = host.spawn("Turret");

    let err = host.ext.deinitialize(InitLevel::Scene).unwrap_err();
    assert!(matches!(
        err,
        HostbindError::Registration(RegistrationError::InstancesAlive { count: 1, .. })
    ));
    assert!(host.stub.registered_class("Turret").is_some());
    assert!(host.ext.is_initialized(InitLevel::Scene));

    host.stub.api().object_destroy(turret);
    host.ext.deinitialize(InitLevel::Scene).unwrap();
    assert_eq!(host.stub.registered_class_count(), 0);
    assert!(!host.ext.is_initialized(InitLevel::Scene));
}

#[derive(Default)]
struct Enemy {
    health: i64,
}

#[derive(Default)]
struct Boss {
    enemy: Enemy,
    enraged: bool,
}

fn register_enemies(host: &TestHost) {
    host.ext
        .register_class(
            InitLevel::Scene,
            ClassBuilder::<Enemy>::new("Enemy")
                .host_base("CharacterBody2D")
                .constructor(|_| Enemy { health: 50 })
                .virtual_method("_hit", |enemy, ctx| {
                    let damage: i64 = ctx.next_arg()?;
                    enemy.health -= damage;
                    ctx.set_return(&enemy.health)
                }),
        )
        .unwrap();
    host.ext
        .register_class(
            InitLevel::Scene,
            ClassBuilder::<Boss>::new("Boss")
                .extension_base("Enemy", |boss: &mut Boss| &mut boss.enemy)
                .constructor(|_| Boss {
                    enemy: Enemy { health: 500 },
                    enraged: false,
                })
                .virtual_method("_enrage", |boss, _ctx| {
                    boss.enraged = true;
                    Ok(())
                }),
        )
        .unwrap();
}

#[test]
fn derived_classes_reach_base_overrides() {
    let host = TestHost::new();
    register_enemies(&host);
    host.ext.initialize(InitLevel::Scene).unwrap();
    assert_eq!(host.stub.registered_class("Boss").unwrap().base, "Enemy");

    let (boss, id) = host.spawn("Boss");
    let (status, ret) = host.call_virtual(boss, "_hit", &[120]);
    assert_eq!(status, HostStatus::Ok);
    assert_eq!(ret[0] as i64, 380);
    host.call_virtual(boss, "_enrage", &[]);

    let state = host
        .ext
        .classes()
        .with_instance(id, |b: &mut Boss| (b.enemy.health, b.enraged));
    assert_eq!(state, Some((380, true)));

    host.stub.api().object_destroy(boss);
    // Subclasses go first, so the base is no longer in use when its turn comes.
    host.ext.deinitialize(InitLevel::Scene).unwrap();
    assert_eq!(host.stub.registered_class_count(), 0);
}

#[test]
fn ref_counted_instances_are_freed_with_their_object() {
    let host = TestHost::new();
    host.stub.mark_ref_counted("RefCounted");
    host.ext
        .register_class(
            InitLevel::Scene,
            ClassBuilder::<Enemy>::new("Inventory")
                .host_base("RefCounted")
                .default_constructor(),
        )
        .unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();

    let (inventory, _) = host.spawn("Inventory");
    assert_eq!(host.stub.ref_count(inventory), Some(1));
    let shared = host.ext.handles().acquire(inventory, HandleKind::RefCounted).unwrap();
    assert_eq!(host.stub.ref_count(inventory), Some(2));

    host.stub.api().ref_decrement(inventory);
    assert_eq!(host.ext.classes().instance_count(), 1);
    shared.release().unwrap();
    assert_eq!(host.stub.destroy_calls(inventory), 1);
    assert_eq!(host.ext.classes().instance_count(), 0);
}

#[test]
fn preload_aborts_a_class_with_missing_binds() {
    const NODE_METHODS: &[&str] = &["get_name", "missing_method"];

    let host = TestHost::new();
    host.stub.register_method("Node", "get_name", |_, _, _, _| {});
    let def = ClassBuilder::<Turret>::new("Turret").default_constructor().build();
    host.ext
        .add_class(InitLevel::Scene, def, &[("Node", NODE_METHODS)])
        .unwrap();

    let err = host.ext.initialize(InitLevel::Scene).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, HostbindError::Bind(_)));
    assert!(host.stub.registered_class("Turret").is_none());
    assert!(!host.ext.classes().contains("Turret"));
    assert_eq!(host.stub.lookup_count("Node", "get_name"), 1);
}

#[test]
fn failing_class_does_not_hold_back_the_rest_of_its_level() {
    const BROKEN_BINDS: &[&str] = &["missing_method"];

    let host = TestHost::new();
    let turret = |name: &str| ClassBuilder::<Turret>::new(name).default_constructor().build();
    host.ext.add_class(InitLevel::Scene, turret("Sentry"), &[]).unwrap();
    host.ext
        .add_class(InitLevel::Scene, turret("Mortar"), &[("Node", BROKEN_BINDS)])
        .unwrap();
    host.ext.add_class(InitLevel::Scene, turret("Flak"), &[]).unwrap();

    let err = host.ext.initialize(InitLevel::Scene).unwrap_err();
    assert!(matches!(err, HostbindError::Bind(_)));

    assert!(host.stub.registered_class("Sentry").is_some());
    assert!(host.stub.registered_class("Mortar").is_none());
    assert!(host.stub.registered_class("Flak").is_some());
    assert!(!host.ext.classes().contains("Mortar"));
    assert!(host.ext.is_initialized(InitLevel::Scene));

    // The level is live: a fixed class registers straight away.
    host.ext.add_class(InitLevel::Scene, turret("Mortar"), &[]).unwrap();
    assert!(host.stub.registered_class("Mortar").is_some());

    host.ext.deinitialize(InitLevel::Scene).unwrap();
    assert_eq!(host.stub.registered_class_count(), 0);
}

#[test]
fn binds_resolve_lazily_without_preload() {
    const NODE_METHODS: &[&str] = &["missing_method"];

    let host = TestHost::with_config(ExtensionConfig::new().preload_binds(false));
    let def = ClassBuilder::<Turret>::new("Turret").default_constructor().build();
    host.ext
        .add_class(InitLevel::Scene, def, &[("Node", NODE_METHODS)])
        .unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();

    assert!(host.stub.registered_class("Turret").is_some());
    assert_eq!(host.stub.lookup_count("Node", "missing_method"), 0);
}

#[test]
fn late_classes_register_immediately() {
    let host = TestHost::new();
    host.ext.initialize(InitLevel::Scene).unwrap();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    assert!(host.stub.registered_class("Turret").is_some());
}

#[test]
fn levels_below_the_minimum_are_skipped() {
    let host = TestHost::with_config(ExtensionConfig::new().minimum_init_level(InitLevel::Scene));
    host.ext.register_class(InitLevel::Core, turret_class()).unwrap();

    host.ext.initialize(InitLevel::Core).unwrap();
    assert!(!host.ext.is_initialized(InitLevel::Core));
    assert!(host.stub.registered_class("Turret").is_none());

    // Queued at the minimum level instead.
    host.ext.initialize(InitLevel::Scene).unwrap();
    assert!(host.stub.registered_class("Turret").is_some());
}

#[test]
fn duplicate_class_is_rejected_without_touching_the_host() {
    let host = TestHost::new();
    host.ext.initialize(InitLevel::Scene).unwrap();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();

    let err = host.ext.register_class(InitLevel::Scene, turret_class()).unwrap_err();
    assert!(matches!(
        err,
        HostbindError::Registration(RegistrationError::DuplicateClass(_))
    ));
    assert_eq!(host.stub.registered_class_count(), 1);
}

#[test]
fn dropping_the_extension_unregisters_its_classes() {
    let host = TestHost::new();
    host.ext.register_class(InitLevel::Scene, turret_class()).unwrap();
    host.ext.initialize(InitLevel::Scene).unwrap();
    let TestHost { ext, stub } = host;
    assert_eq!(stub.registered_class_count(), 1);

    drop(ext);
    assert_eq!(stub.registered_class_count(), 0);
}

#[test]
fn incompatible_hosts_are_rejected_at_load() {
    let stub = hostbind_core::stub::StubHost::new();

    let err = Extension::load(&stub.interface(), ExtensionConfig::new().required_abi(2, 0)).unwrap_err();
    assert!(matches!(err, HostbindError::Config(ConfigError::AbiMismatch { .. })));

    let interface = HostInterface {
        class_register: None,
        ..stub.interface()
    };
    let err = Extension::load(&interface, ExtensionConfig::new()).unwrap_err();
    assert!(matches!(
        err,
        HostbindError::Config(ConfigError::MissingEntryPoint("class_register"))
    ));
}
