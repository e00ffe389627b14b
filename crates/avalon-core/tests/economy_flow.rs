//! End-to-end inventory flows over the in-process bus and store.
//!
//! Runs with tokio's paused clock: sleeps advance virtual time instantly,
//! so minute-long constructions complete in microseconds of wall time.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use avalon_core::bus::{EventBus, InMemoryBus, publish_event};
use avalon_core::catalog::BlueprintCatalog;
use avalon_core::config::{InventoryConfig, LivenessConfig, NodeConfig};
use avalon_core::directory::{Directory, GrainContext};
use avalon_core::inventory::{InventoryError, InventoryHandle, InventoryView};
use avalon_core::store::InMemoryStore;
use avalon_types::{GrainKind, InventoryId, ResourceName, TimerFired, TimerKind, topics};

const BUILDINGS: &str = r"
- name: house
  cost:
    - resource: Wood
      amount: 5
    - resource: Stone
      amount: 2
      permanent: true
  build_time_ms: 10000
- name: woodcutter
  cost:
    - resource: Wood
      amount: 1
  build_time_ms: 5000
  generates:
    - resource: Wood
      amount: 2
      tick_length_ms: 1000
- name: lumberyard
  initial_amount: 0
  transforms:
    - name: planks
      cost:
        - resource: Wood
          amount: 2
      result:
        - resource: Planks
          amount: 1
      tick_length_ms: 1000
";

const RESOURCES: &str = r"
- name: Wood
  starting_amount: 20
  cap_formula: 'return 100 + buildings.house * 50'
- name: Stone
  starting_amount: 10
- name: Planks
  starting_amount: 0
";

struct Fixture {
    bus: Arc<InMemoryBus>,
    store: Arc<InMemoryStore>,
    directory: Arc<Directory>,
}

fn fixture() -> Fixture {
    fixture_with(BUILDINGS, RESOURCES)
}

fn fixture_with(buildings: &str, resources: &str) -> Fixture {
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(InMemoryStore::new());
    let directory = directory(&bus, &store, buildings, resources);
    Fixture {
        bus,
        store,
        directory,
    }
}

fn directory(
    bus: &Arc<InMemoryBus>,
    store: &Arc<InMemoryStore>,
    buildings: &str,
    resources: &str,
) -> Arc<Directory> {
    let catalog = BlueprintCatalog::from_yaml(buildings, resources).unwrap();
    Directory::new(GrainContext {
        bus: Arc::clone(bus) as Arc<dyn EventBus>,
        store: Arc::clone(store) as Arc<dyn avalon_core::store::SnapshotStore>,
        catalog: Arc::new(catalog),
        node: NodeConfig::default(),
        liveness: LivenessConfig::default(),
        inventory: InventoryConfig::default(),
    })
}

/// Poll `describe` until `check` holds or virtual time runs out.
async fn eventually(
    handle: &InventoryHandle,
    check: impl Fn(&InventoryView) -> bool,
) -> InventoryView {
    for _ in 0..500 {
        let view = handle.describe(true).await.unwrap();
        if check(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn amount(view: &InventoryView, resource: &str) -> u64 {
    view.resource(resource).unwrap().amount
}

fn reserved(view: &InventoryView, resource: &str) -> u64 {
    view.resource(resource).unwrap().reserved
}

fn completed(view: &InventoryView, building: &str) -> usize {
    view.building(building).unwrap().completed.len()
}

#[tokio::test(start_paused = true)]
async fn cold_start_uses_catalog_defaults() {
    let f = fixture();
    let inventory = f.directory.inventory(InventoryId::for_player(uuid::Uuid::new_v4()));

    let view = inventory.describe(false).await.unwrap();
    assert_eq!(amount(&view, "Stone"), 10);
    assert_eq!(view.resource("Wood").unwrap().cap, 100);
    assert_eq!(completed(&view, "house"), 0);
    assert_eq!(amount(&view, "Planks"), 0);
    assert_eq!(completed(&view, "lumberyard"), 0);
    assert!(view.timers.is_none());
}

#[tokio::test(start_paused = true)]
async fn construction_reserves_then_settles_costs() {
    let f = fixture();
    let id = InventoryId::new();
    let inventory = f.directory.inventory(id);

    let started = inventory.start_building("House", false).await.unwrap();
    let timer = f
        .directory
        .timer(started.timer_id)
        .unwrap()
        .describe()
        .await
        .unwrap();
    assert_eq!(timer.kind, TimerKind::Building);
    assert_eq!(timer.inventory_id, id);
    assert_eq!(timer.interval_ms, 10_000);
    assert_eq!(timer.fired, 0);
    assert_eq!(timer.reply_topic, topics::building_callbacks(id));

    let view = inventory.describe(true).await.unwrap();
    assert_eq!(reserved(&view, "Wood"), 5);
    assert_eq!(amount(&view, "Stone"), 8);
    assert_eq!(reserved(&view, "Stone"), 2);
    assert_eq!(view.building("house").unwrap().queued.len(), 1);
    assert!(view.timers.unwrap().contains(&started.timer_id));

    // One construction at a time.
    assert!(matches!(
        inventory.start_building("woodcutter", false).await,
        Err(InventoryError::SlotOccupied)
    ));
    assert!(matches!(
        inventory.start_building("castle", false).await,
        Err(InventoryError::UnknownBuilding { .. })
    ));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let view = eventually(&inventory, |v| completed(v, "house") == 1).await;

    assert!(view.building("house").unwrap().queued.is_empty());
    // The temporary cost returns, the permanent one is consumed.
    assert_eq!(reserved(&view, "Wood"), 0);
    assert_eq!(amount(&view, "Stone"), 8);
    assert_eq!(reserved(&view, "Stone"), 0);
    // One house raises the wood cap.
    assert_eq!(view.resource("Wood").unwrap().cap, 150);
}

#[tokio::test(start_paused = true)]
async fn insufficient_resources_leave_state_untouched() {
    let poor = RESOURCES.replace("starting_amount: 20", "starting_amount: 3");
    let f = fixture_with(BUILDINGS, &poor);
    let inventory = f.directory.inventory(InventoryId::new());
    let before = inventory.describe(false).await.unwrap();

    match inventory.start_building("house", false).await {
        Err(InventoryError::InsufficientResources { resources }) => {
            assert_eq!(resources.len(), 1);
            assert_eq!(resources[0].as_str(), "Wood");
        }
        other => panic!("expected insufficient resources, got {other:?}"),
    }

    let after = inventory.describe(false).await.unwrap();
    assert_eq!(before.resources, after.resources);
    assert!(after.building("house").unwrap().queued.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reserve_reports_ledger_errors_unchanged() {
    let f = fixture();
    let inventory = f.directory.inventory(InventoryId::new());

    let bogus = BTreeMap::from([(ResourceName::from("bogus"), 1)]);
    match inventory.reserve(bogus).await {
        Err(InventoryError::UnknownResource { resource }) => assert_eq!(resource.as_str(), "bogus"),
        other => panic!("expected unknown resource, got {other:?}"),
    }

    let oversized = BTreeMap::from([
        (ResourceName::from("Wood"), 1000),
        (ResourceName::from("Stone"), 1),
    ]);
    match inventory.reserve(oversized).await {
        Err(InventoryError::InsufficientResources { resources }) => {
            assert_eq!(resources, vec![ResourceName::from("Wood")]);
        }
        other => panic!("expected insufficient resources, got {other:?}"),
    }
    let view = inventory.describe(false).await.unwrap();
    assert_eq!(amount(&view, "Stone"), 10);
    assert_eq!(reserved(&view, "Stone"), 0);

    let all_wood = BTreeMap::from([(ResourceName::from("Wood"), 20)]);
    inventory.reserve(all_wood).await.unwrap();
    let view = inventory.describe(false).await.unwrap();
    assert_eq!(amount(&view, "Wood"), 0);
    assert_eq!(reserved(&view, "Wood"), 20);
}

#[tokio::test(start_paused = true)]
async fn completed_generator_produces_each_tick() {
    let f = fixture();
    let inventory = f.directory.inventory(InventoryId::new());

    inventory.start_building("woodcutter", false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let view = eventually(&inventory, |v| completed(v, "woodcutter") == 1).await;
    let wood = amount(&view, "Wood");

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let view = eventually(&inventory, |v| amount(v, "Wood") >= wood + 6).await;
    assert_eq!(reserved(&view, "Wood"), 0);
}

#[tokio::test(start_paused = true)]
async fn disabled_generators_stay_idle() {
    let f = fixture();
    let inventory = f.directory.inventory(InventoryId::new());

    inventory.start_building("woodcutter", true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let view = eventually(&inventory, |v| completed(v, "woodcutter") == 1).await;
    let wood = amount(&view, "Wood");
    let instance = &view.building("woodcutter").unwrap().completed[0];
    assert!(instance.generator_timer_ids.is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let view = inventory.describe(false).await.unwrap();
    assert_eq!(amount(&view, "Wood"), wood);
}

#[tokio::test(start_paused = true)]
async fn transformer_skips_ticks_it_cannot_afford() {
    let busy = BUILDINGS.replace("initial_amount: 0", "initial_amount: 1");
    let scarce = RESOURCES.replace("starting_amount: 20", "starting_amount: 3");
    let f = fixture_with(&busy, &scarce);
    let inventory = f.directory.inventory(InventoryId::new());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let view = eventually(&inventory, |v| amount(v, "Planks") == 1).await;
    assert_eq!(amount(&view, "Wood"), 1);
    assert_eq!(reserved(&view, "Wood"), 0);

    // Only one Wood left: every further tick is skipped.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let view = inventory.describe(false).await.unwrap();
    assert_eq!(amount(&view, "Planks"), 1);
    assert_eq!(amount(&view, "Wood"), 1);
}

#[tokio::test(start_paused = true)]
async fn redelivered_completion_is_ignored() {
    let f = fixture();
    let id = InventoryId::new();
    let mut callbacks = f
        .bus
        .subscribe(&topics::building_callbacks(id))
        .await
        .unwrap();
    let inventory = f.directory.inventory(id);

    inventory.start_building("house", false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    let bytes = callbacks.next().await.unwrap();
    let fired: TimerFired = serde_json::from_slice(&bytes).unwrap();
    let view = eventually(&inventory, |v| completed(v, "house") == 1).await;

    publish_event(f.bus.as_ref(), &topics::building_callbacks(id), &fired)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let again = inventory.describe(false).await.unwrap();
    assert_eq!(completed(&again, "house"), 1);
    assert_eq!(again.resources, view.resources);
}

#[tokio::test(start_paused = true)]
async fn persist_and_restore_round_trip() {
    let f = fixture();
    let id = InventoryId::new();
    let inventory = f.directory.inventory(id);

    inventory.start_building("house", false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    eventually(&inventory, |v| completed(v, "house") == 1).await;
    inventory.start_building("woodcutter", false).await.unwrap();

    let bytes = inventory.persist().await.unwrap();
    assert_eq!(f.store.row_count(GrainKind::Inventory, id.into_inner()), 1);
    let persisted = inventory.describe(false).await.unwrap();

    // Garbage is rejected and the live state is kept.
    assert!(matches!(
        inventory.restore(vec![0xde, 0xad]).await,
        Err(InventoryError::SnapshotDecode { .. })
    ));
    inventory.restore(bytes).await.unwrap();
    let restored = inventory.describe(false).await.unwrap();
    assert_eq!(restored.resources, persisted.resources);
    for (a, b) in restored.buildings.iter().zip(&persisted.buildings) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.completed.len(), b.completed.len());
        assert_eq!(a.queued.len(), b.queued.len());
    }

    // Stop, then reactivate from the store on a fresh directory.
    inventory.stop(false).await.unwrap();
    let directory = directory(&f.bus, &f.store, BUILDINGS, RESOURCES);
    let revived = directory.inventory(id);
    let view = revived.describe(false).await.unwrap();
    assert_eq!(completed(&view, "house"), 1);
    assert_eq!(view.building("woodcutter").unwrap().queued.len(), 1);
    assert_eq!(view.resource("Wood").unwrap().cap, 150);

    // The re-armed construction still completes.
    tokio::time::sleep(Duration::from_secs(5)).await;
    eventually(&revived, |v| completed(v, "woodcutter") == 1).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_persists_every_inventory() {
    let f = fixture();
    let a = f.directory.inventory(InventoryId::new());
    let b = f.directory.inventory(InventoryId::new());
    a.describe(false).await.unwrap();
    b.describe(false).await.unwrap();

    let report = f.directory.shutdown(true).await;
    assert_eq!(report.inventories_stopped, 2);
    assert_eq!(report.inventories_failed, 0);
    assert_eq!(
        f.store.row_count(GrainKind::Inventory, a.inventory_id().into_inner()),
        1
    );
    assert!(a.describe(false).await.is_err());
}
