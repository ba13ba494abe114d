use std::collections::BTreeMap;

use proptest::prelude::*;

use smartcache::{EntityKey, EntityStore, Fields, InMemoryEntityStore, Value};

fn scalar_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[a-z ]{0,8}".prop_map(Value::String),
    ]
}

fn field_map() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map("[a-f]", scalar_value(), 0..6)
}

fn item(n: usize) -> EntityKey {
    EntityKey::new("Item", n.to_string())
}

proptest! {
    #[test]
    fn writes_merge_field_by_field(first in field_map(), second in field_map()) {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::new("Suggestion", "1");
        store.write(&key, first.clone()).unwrap();
        store.write(&key, second.clone()).unwrap();

        let mut expected = first;
        expected.extend(second);
        prop_assert_eq!(store.read(&key).unwrap().unwrap_or_default(), expected);
    }

    #[test]
    fn gc_is_idempotent_and_keeps_reachable(
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..24),
        rooted in prop::collection::btree_set(0usize..12, 0..4),
    ) {
        let store = InMemoryEntityStore::new();
        let mut outgoing: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
        for (from, to) in &edges {
            outgoing.entry(*from).or_default().push(Value::Ref(item(*to)));
        }
        for n in 0..12 {
            let mut fields = Fields::new();
            fields.insert("links".to_string(), Value::List(outgoing.remove(&n).unwrap_or_default()));
            store.write(&item(n), fields).unwrap();
        }
        let mut root = Fields::new();
        root.insert(
            "items".to_string(),
            Value::List(rooted.iter().map(|n| Value::Ref(item(*n))).collect()),
        );
        store.write(&EntityKey::root_query(), root).unwrap();

        let removed = store.garbage_collect().unwrap();
        prop_assert!(store.garbage_collect().unwrap().is_empty());
        for n in &rooted {
            prop_assert!(store.contains(&item(*n)).unwrap());
        }
        for key in &removed {
            prop_assert!(!store.contains(key).unwrap());
        }
        // Survivors still reach each other only through kept entities.
        for key in store.keys().unwrap() {
            let Some(Value::List(links)) = store.read_field(&key, "links").unwrap() else {
                continue;
            };
            for link in links {
                if let Value::Ref(target) = link {
                    prop_assert!(store.contains(&target).unwrap());
                }
            }
        }
    }

    #[test]
    fn restore_undoes_evict(fields in field_map()) {
        let store = InMemoryEntityStore::new();
        let key = EntityKey::new("Comment", "7");
        store.write(&key, fields.clone()).unwrap();
        let snapshot = store.read(&key).unwrap();

        store.evict(&key).unwrap();
        store.restore(&key, snapshot.clone()).unwrap();
        prop_assert_eq!(store.read(&key).unwrap(), snapshot);
    }
}

#[test]
fn retained_roots_survive_gc_until_released() {
    let store = InMemoryEntityStore::new();
    let batch = EntityKey::new("Batch", "b1");
    let mut fields = Fields::new();
    fields.insert("status".to_string(), Value::from("open"));
    store.write(&batch, fields).unwrap();

    store.retain(&batch).unwrap();
    store.retain(&batch).unwrap();
    assert!(store.garbage_collect().unwrap().is_empty());

    store.release(&batch).unwrap();
    assert!(store.garbage_collect().unwrap().is_empty());

    store.release(&batch).unwrap();
    assert_eq!(store.garbage_collect().unwrap(), vec![batch]);
}
