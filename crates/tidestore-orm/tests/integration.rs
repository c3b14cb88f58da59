//! Integration tests: the entity database living inside a versioned store.
//!
//! These tests drive batch updates through `StoreOrmExt`, observe them from
//! subscribers and entity projections, and check the database properties
//! with proptest.

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use tidestore_core::{Changes, Executor, Job, RecordingSanitizer, RuntimeError, Store, TargetQueue};
use tidestore_orm::{
    BatchError, BatchResult, BatchUpdateContext, Database, DatabaseComparisons, DatabaseEmbedding, Entity, EntityId,
    GroupedIndex, IndexKey, OrderedIndex, SetIndex, StoreOrmExt,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
struct Node {
    id: String,
    label: String,
}

impl Entity for Node {
    type RawId = String;
    fn raw_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Item {
    id: u32,
    qty: u32,
}

impl Entity for Item {
    type RawId = u32;
    fn raw_id(&self) -> u32 {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Folder {
    id: u32,
}

impl Entity for Folder {
    type RawId = u32;
    fn raw_id(&self) -> u32 {
        self.id
    }
}

enum NodeOrder {}

impl IndexKey for NodeOrder {
    type Index = OrderedIndex<Node>;
}

enum ItemOrder {}

impl IndexKey for ItemOrder {
    type Index = OrderedIndex<Item>;
}

enum Flagged {}

impl IndexKey for Flagged {
    type Index = SetIndex<Item>;
}

enum ItemsByFolder {}

impl IndexKey for ItemsByFolder {
    type Index = GroupedIndex<Folder, Item>;
}

#[derive(Clone, Default)]
struct AppState {
    db: Database,
    screen: u32,
}

impl DatabaseEmbedding for AppState {
    fn database(&self) -> &Database {
        &self.db
    }

    fn database_mut(&mut self) -> &mut Database {
        &mut self.db
    }
}

fn node(id: &str, label: &str) -> Node {
    Node { id: id.into(), label: label.into() }
}

fn item_id(raw: u32) -> EntityId<Item> {
    EntityId::new(raw)
}

fn versions_of(store: &Store<AppState>) -> (Arc<Mutex<Vec<u64>>>, tidestore_core::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = store
        .subscribe(TargetQueue::inline(), true, move |c: Changes<AppState>| sink.lock().push(c.version()))
        .unwrap();
    (seen, sub)
}

#[derive(Default)]
struct ManualExecutor {
    jobs: Mutex<Vec<Job>>,
}

impl Executor for ManualExecutor {
    fn execute(&self, job: Job) {
        self.jobs.lock().push(job);
    }
}

#[derive(Clone, Debug)]
enum Op {
    Insert(u32),
    Update(u32),
    Delete(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..24u32).prop_map(Op::Insert),
        (0..24u32).prop_map(Op::Update),
        (0..24u32).prop_map(Op::Delete),
    ]
}

fn stage(ctx: &mut BatchUpdateContext<'_>, ops: &[Op]) {
    for op in ops {
        match *op {
            Op::Insert(raw) => {
                let id = ctx.table::<Item>().insert(Item { id: raw, qty: 0 });
                ctx.index_mut::<ItemOrder>().push(id.clone());
                ctx.index_mut::<Flagged>().insert(id.clone());
                ctx.index_mut::<ItemsByFolder>().push(EntityId::new(raw % 3), id);
            }
            Op::Update(raw) => {
                ctx.table::<Item>().update_if_exists(&item_id(raw), |i| i.qty += 1);
            }
            Op::Delete(raw) => ctx.table::<Item>().delete(item_id(raw)),
        }
    }
}

fn seeded_items(count: u32) -> Database {
    let mut db = Database::new();
    let ops: Vec<Op> = (0..count).map(Op::Insert).collect();
    db.perform_batch_update(|ctx| {
        stage(ctx, &ops);
        Ok(())
    })
    .unwrap();
    db
}

// ---------------------------------------------------------------------------
// Batch Updates Through A Store
// ---------------------------------------------------------------------------

#[test]
fn test_ordered_index_round_trip() {
    let store = Store::new(AppState::default());
    store
        .batch_update(|ctx| {
            let ids = ctx.table::<Node>().insert_many(vec![node("a", "A"), node("b", "B")]);
            ctx.index_mut::<NodeOrder>().extend(ids);
            Ok(())
        })
        .unwrap();

    let state = store.state();
    let db = state.current().database();
    let order = db.index::<NodeOrder>();
    assert_eq!(db.table::<Node>().find_in(order.ids()), vec![node("a", "A"), node("b", "B")]);

    store
        .batch_update(|ctx| {
            ctx.table::<Node>().delete(EntityId::new("a".to_string()));
            Ok(())
        })
        .unwrap();

    let state = store.state();
    let db = state.current().database();
    let order = db.index::<NodeOrder>();
    assert_eq!(order.ids(), &[EntityId::<Node>::new("b".to_string())]);
    assert_eq!(db.table::<Node>().find_in(order.ids()), vec![node("b", "B")]);
}

#[test]
fn test_insert_then_find_within_batch() {
    let store = Store::new(AppState::default());
    let found = store
        .batch_update(|ctx| {
            let id = ctx.table::<Node>().insert(node("x", "X"));
            Ok(ctx.table::<Node>().find(&id).cloned())
        })
        .unwrap();
    assert_eq!(found, Some(node("x", "X")));
}

#[test]
fn test_aborted_batch_notifies_nobody() {
    let store = Store::new(AppState::default());
    let (versions, _sub) = versions_of(&store);

    let result: BatchResult<()> = store.batch_update(|ctx| {
        ctx.table::<Node>().insert(node("a", "A"));
        ctx.index_mut::<NodeOrder>().push(EntityId::new("a".to_string()));
        ctx.abort()
    });

    assert_eq!(result, Err(BatchError::Aborted));
    assert_eq!(store.version(), 0);
    assert!(versions.lock().is_empty());
    assert!(store.state().db.table::<Node>().is_empty());
    assert!(store.state().db.index::<NodeOrder>().is_empty());
}

#[test]
fn test_update_missing_entity_fails_batch() {
    let store = Store::new(AppState::default());
    let result = store.batch_update(|ctx| {
        ctx.table::<Node>().insert(node("a", "A"));
        ctx.table::<Item>().update_exists(&item_id(9), |i| i.qty = 1)?;
        Ok(())
    });
    assert_eq!(result, Err(BatchError::StoredEntityNotFound { entity_type: "Item" }));
    assert!(store.state().db.table::<Node>().is_empty());
}

#[test]
fn test_read_only_batch_is_noop() {
    let store = Store::new(AppState::default());
    store
        .batch_update(|ctx| {
            ctx.table::<Node>().insert(node("a", "A"));
            Ok(())
        })
        .unwrap();
    let (versions, _sub) = versions_of(&store);

    let label = store
        .batch_update(|ctx| Ok(ctx.table::<Node>().find(&EntityId::new("a".to_string())).map(|n| n.label.clone())))
        .unwrap();

    assert_eq!(label.as_deref(), Some("A"));
    assert_eq!(store.version(), 1);
    assert!(versions.lock().is_empty());
}

#[test]
fn test_database_middleware_runs_through_store() {
    let db = Database::new().with_middleware(|ctx: &mut BatchUpdateContext<'_>| {
        let staged: Vec<EntityId<Item>> = ctx.table::<Item>().staged().all_ids();
        ctx.index_mut::<Flagged>().extend(staged);
    });
    let store = Store::new(AppState { db, screen: 0 });

    store
        .batch_update(|ctx| {
            ctx.table::<Item>().insert(Item { id: 1, qty: 3 });
            Ok(())
        })
        .unwrap();

    assert!(store.state().db.index::<Flagged>().contains(&item_id(1)));
}

#[test]
fn test_comparisons_between_commits() {
    let store = Store::new(AppState { db: seeded_items(4), screen: 0 });
    store
        .batch_update(|ctx| {
            ctx.table::<Item>().update_exists(&item_id(2), |i| i.qty = 7)?;
            Ok(())
        })
        .unwrap();

    let state = store.state();
    let previous = state.previous_value().unwrap().database();
    let current = state.current().database();
    assert!(DatabaseComparisons::entity_no_updates(item_id(1)).equals(previous, current));
    assert!(!DatabaseComparisons::entity_no_updates(item_id(2)).equals(previous, current));
    assert!(DatabaseComparisons::table_no_updates::<Node>().equals(previous, current));
}

// ---------------------------------------------------------------------------
// Notification Order
// ---------------------------------------------------------------------------

#[test]
fn test_versions_strictly_increase() {
    let store = Store::new(AppState::default());
    let (versions, _sub) = versions_of(&store);

    for raw in 0..5u32 {
        store
            .batch_update(|ctx| {
                ctx.table::<Item>().insert(Item { id: raw, qty: 0 });
                Ok(())
            })
            .unwrap();
        store.commit(|s| s.screen).unwrap();
    }

    assert_eq!(*versions.lock(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_out_of_order_delivery_recovers() {
    let sanitizer = RecordingSanitizer::new();
    let store = Store::builder(AppState::default())
        .sanitizer(sanitizer.clone())
        .build()
        .unwrap();
    let manual = Arc::new(ManualExecutor::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = store
        .subscribe(TargetQueue::custom(manual.clone()), true, move |c: Changes<AppState>| {
            sink.lock().push((c.version(), c.db.table::<Item>().len()));
        })
        .unwrap();

    for raw in 1..=3u32 {
        store
            .batch_update(|ctx| {
                ctx.table::<Item>().insert(Item { id: raw, qty: 0 });
                Ok(())
            })
            .unwrap();
    }

    let mut jobs = std::mem::take(&mut *manual.jobs.lock());
    let v3 = jobs.pop().unwrap();
    let v2 = jobs.pop().unwrap();
    let v1 = jobs.pop().unwrap();
    v1();
    v3();
    v2();

    // Version 2 arrives late and is answered with version 3's data
    assert_eq!(*seen.lock(), vec![(1, 1), (3, 3), (3, 3)]);
    assert_eq!(sanitizer.errors().len(), 1);
    assert!(matches!(
        sanitizer.errors()[0],
        RuntimeError::RecoveredFromOlderVersion { latest: 3, received: 2, .. }
    ));
}

// ---------------------------------------------------------------------------
// Entity Projections
// ---------------------------------------------------------------------------

#[test]
fn test_entity_projection_is_memoized() {
    let store = Store::new(AppState { db: seeded_items(3), screen: 0 });
    let queue = TargetQueue::inline();

    let first = store.derived_entity(item_id(1), queue.clone()).unwrap();
    let second = store.derived_entity(item_id(1), queue.clone()).unwrap();
    assert!(first.ptr_eq(&second));
    drop(second);

    let cached = store.derived_cache_len();
    drop(first);
    let again = store.derived_entity(item_id(1), queue).unwrap();
    assert_eq!(again.value().entity, Some(Item { id: 1, qty: 0 }));
    assert!(store.derived_cache_len() <= cached);
}

#[test]
fn test_entity_projection_ignores_other_entities() {
    let store = Store::new(AppState { db: seeded_items(3), screen: 0 });
    let derived = store.derived_entity(item_id(0), TargetQueue::inline()).unwrap();

    store.commit(|s| s.screen = 1).unwrap();
    store
        .batch_update(|ctx| {
            ctx.table::<Item>().update_exists(&item_id(2), |i| i.qty = 5)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(derived.version(), 0);

    store
        .batch_update(|ctx| {
            ctx.table::<Item>().update_exists(&item_id(0), |i| i.qty = 5)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(derived.version(), 1);
    assert_eq!(derived.value().entity, Some(Item { id: 0, qty: 5 }));
}

#[test]
fn test_queried_entities_follow_grouped_index() {
    let store = Store::new(AppState { db: seeded_items(6), screen: 0 });
    let folder: EntityId<Folder> = EntityId::new(0);
    let list = store
        .derived_queried_entities(
            move |db: &Database| db.index::<ItemsByFolder>().children(&folder).to_vec(),
            TargetQueue::inline(),
        )
        .unwrap();

    let ids: Vec<u32> = list.value().iter().map(|d| *d.value().id.raw()).collect();
    assert_eq!(ids, vec![0, 3]);

    store
        .batch_update(|ctx| {
            ctx.table::<Item>().delete(item_id(0));
            Ok(())
        })
        .unwrap();
    let ids: Vec<u32> = list.value().iter().map(|d| *d.value().id.raw()).collect();
    assert_eq!(ids, vec![3]);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_aborted_batch_leaves_database(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let mut db = seeded_items(12);
        let before = db.clone();

        let result: BatchResult<()> = db.perform_batch_update(|ctx| {
            stage(ctx, &ops);
            ctx.abort()
        });

        prop_assert_eq!(result, Err(BatchError::Aborted));
        prop_assert_eq!(&db, &before);
        prop_assert!(*db.table::<Item>() == *before.table::<Item>());
        let order = db.index::<ItemOrder>().ids().to_vec();
        let order_before = before.index::<ItemOrder>().ids().to_vec();
        prop_assert_eq!(order, order_before);
    }

    #[test]
    fn prop_indexes_never_outlive_entities(
        first in prop::collection::vec(op_strategy(), 0..40),
        second in prop::collection::vec(op_strategy(), 0..40),
    ) {
        let mut db = Database::new();
        for ops in [&first, &second] {
            db.perform_batch_update(|ctx| {
                stage(ctx, ops);
                Ok(())
            })
            .unwrap();
        }

        let table = db.table::<Item>();
        for id in db.index::<ItemOrder>().ids() {
            prop_assert!(table.contains(id), "ordered index kept {:?}", id);
        }
        for id in db.index::<Flagged>().iter() {
            prop_assert!(table.contains(id), "set index kept {:?}", id);
        }
        let grouped = db.index::<ItemsByFolder>();
        for parent in grouped.groups() {
            prop_assert!(!grouped.children(parent).is_empty());
            for id in grouped.children(parent) {
                prop_assert!(table.contains(id), "grouped index kept {:?}", id);
            }
        }
    }

    #[test]
    fn prop_versions_count_only_writes(writes in prop::collection::vec(any::<bool>(), 0..24)) {
        let store = Store::new(AppState::default());
        let (versions, _sub) = versions_of(&store);

        for (n, write) in writes.iter().enumerate() {
            store
                .batch_update(|ctx| {
                    if *write {
                        ctx.table::<Item>().insert(Item { id: n as u32, qty: 0 });
                    }
                    Ok(ctx.table::<Item>().current().len())
                })
                .unwrap();
        }

        let expected: Vec<u64> = (1..=writes.iter().filter(|w| **w).count() as u64).collect();
        prop_assert_eq!(versions.lock().clone(), expected);
        prop_assert_eq!(store.version(), writes.iter().filter(|w| **w).count() as u64);
    }
}
