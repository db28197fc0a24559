use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use loro::{ExportMode, LoroDoc, ToJson};
use loro_mirror::{synced_text, ChangeSource, ListRef, MapRef, Mirror, MirrorError, Value};
use pretty_assertions::assert_eq;
use serde_json::json;

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn root_json(doc: &LoroDoc) -> serde_json::Value {
    doc.get_map("data").get_deep_value().to_json_value()
}

fn map_mirror() -> (LoroDoc, Mirror) {
    let doc = LoroDoc::new();
    let mirror = Mirror::new(&doc, doc.get_map("data")).unwrap();
    (doc, mirror)
}

fn root_map(mirror: &Mirror) -> MapRef {
    mirror.root().into_map().unwrap()
}

fn list_at(root: &MapRef, key: &str) -> ListRef {
    root.get(key).unwrap().into_list().unwrap()
}

fn sync(from: &LoroDoc, to: &LoroDoc) {
    to.import(&from.export(ExportMode::all_updates()).unwrap())
        .unwrap();
}

#[test]
fn set_then_delete_same_key_in_one_commit() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);
    root.insert("a", 1)?;
    root.insert("a", 2)?;
    root.delete("a")?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({}));
    assert_eq!(mirror.to_value().to_json_value(), json!({}));
    Ok(())
}

#[test]
fn push_three_into_a_fresh_list() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);
    root.insert("xs", json!([]))?;
    let xs = list_at(&root, "xs");
    xs.push(1)?;
    xs.push(2)?;
    xs.push(3)?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "xs": [1, 2, 3] }));
    assert_eq!(mirror.to_value().to_json_value(), json!({ "xs": [1, 2, 3] }));
    Ok(())
}

#[test]
fn replace_at_index() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    mirror.bootstrap(json!({ "xs": [10, 20, 30] }))?;
    let xs = list_at(&root_map(&mirror), "xs");
    xs.set(1, 99)?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "xs": [10, 99, 30] }));
    Ok(())
}

#[test]
fn insert_and_delete_compose() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    mirror.bootstrap(json!({ "xs": [4, 5] }))?;
    let xs = list_at(&root_map(&mirror), "xs");
    xs.insert(0, 1)?;
    xs.insert(1, 2)?;
    xs.insert(2, 3)?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "xs": [1, 2, 3, 4, 5] }));

    xs.delete(1, 2)?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "xs": [1, 4, 5] }));

    assert_eq!(xs.pop()?, Some(Value::I64(5)));
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "xs": [1, 4] }));

    xs.clear()?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "xs": [] }));
    Ok(())
}

#[test]
fn concurrent_insert_and_delete_converge() -> anyhow::Result<()> {
    let doc_a = LoroDoc::new();
    doc_a.set_peer_id(1)?;
    let mirror_a = Mirror::new(&doc_a, doc_a.get_map("data"))?;
    mirror_a.bootstrap(json!({ "xs": ["a", "b", "c"] }))?;

    let doc_b = LoroDoc::new();
    doc_b.set_peer_id(2)?;
    let mirror_b = Mirror::new(&doc_b, doc_b.get_map("data"))?;
    sync(&doc_a, &doc_b);

    // Peer A removes "b"; peer B concurrently inserts "x" where "b" was.
    let xs_a = list_at(&root_map(&mirror_a), "xs");
    xs_a.delete(1, 1)?;
    mirror_a.commit()?;

    let xs_b = list_at(&root_map(&mirror_b), "xs");
    xs_b.insert(1, "x")?;
    mirror_b.commit()?;

    sync(&doc_a, &doc_b);
    sync(&doc_b, &doc_a);

    assert_eq!(root_json(&doc_a), root_json(&doc_b));
    assert_eq!(root_json(&doc_a), json!({ "xs": ["a", "x", "c"] }));
    assert_eq!(
        mirror_a.to_value().to_json_value(),
        mirror_b.to_value().to_json_value()
    );
    Ok(())
}

#[test]
fn assigning_a_text_twice_is_a_reparent() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);
    let t = synced_text("hi");
    root.insert("a", t.clone())?;
    let err = root.insert("b", t.clone()).unwrap_err();
    assert!(matches!(err, MirrorError::Reparent { .. }));
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "a": "hi" }));

    // Attached now; a later attempt fails the same way.
    assert!(t.is_attached());
    let err = root.insert("c", t.clone()).unwrap_err();
    assert!(matches!(err, MirrorError::Reparent { .. }));
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "a": "hi" }));
    Ok(())
}

#[test]
fn remote_update_emits_no_local_ops() -> anyhow::Result<()> {
    let doc_a = LoroDoc::new();
    let mirror_a = Mirror::new(&doc_a, doc_a.get_map("data"))?;
    mirror_a.bootstrap(json!({ "n": 1 }))?;

    let doc_b = LoroDoc::new();
    let mirror_b = Mirror::new(&doc_b, doc_b.get_map("data"))?;
    // Materialize B's tree before the update arrives.
    let root_b = root_map(&mirror_b);

    let self_ops = Arc::new(AtomicUsize::new(0));
    let counter = self_ops.clone();
    let origin_b = mirror_b.origin().to_string();
    let _sub = doc_b.subscribe_root(Arc::new(move |event| {
        if event.origin == origin_b {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    sync(&doc_a, &doc_b);
    assert_eq!(root_b.to_value().to_json_value(), json!({ "n": 1 }));

    root_map(&mirror_a).insert("n", 2)?;
    mirror_a.commit()?;
    sync(&doc_a, &doc_b);
    assert_eq!(root_b.to_value().to_json_value(), json!({ "n": 2 }));

    // Reconciliation captured nothing, so this commit is a no-op.
    mirror_b.commit()?;
    assert_eq!(self_ops.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn bootstrap_round_trips_nested_values() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let initial = json!({
        "title": "x",
        "ratio": 2.5,
        "on": true,
        "none": null,
        "cfg": { "depth": 3, "tags": ["a", "b"] },
        "rows": [[1, 2], { "k": "v" }],
    });
    mirror.bootstrap(initial.clone())?;
    assert_eq!(root_json(&doc), initial);
    assert_eq!(mirror.to_value().to_json_value(), initial);

    // Idempotent: the second bootstrap leaves everything alone.
    mirror.bootstrap(json!({ "other": 1 }))?;
    assert_eq!(root_json(&doc), initial);
    Ok(())
}

#[test]
fn proxy_identity_is_stable_until_replaced() -> anyhow::Result<()> {
    let (_doc, mirror) = map_mirror();
    mirror.bootstrap(json!({ "cfg": { "x": 1 } }))?;
    let root = root_map(&mirror);
    let first = root.get("cfg").unwrap().into_map().unwrap();
    let second = root.get("cfg").unwrap().into_map().unwrap();
    assert_eq!(first, second);

    root.insert("cfg", json!({ "y": 2 }))?;
    mirror.commit()?;
    let third = root.get("cfg").unwrap().into_map().unwrap();
    assert_ne!(first, third);
    Ok(())
}

#[test]
fn stale_handle_writes_are_dropped() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    mirror.bootstrap(json!({ "cfg": { "x": 1 } }))?;
    let root = root_map(&mirror);
    let old_cfg = root.get("cfg").unwrap().into_map().unwrap();

    root.insert("cfg", json!({ "y": 2 }))?;
    mirror.commit()?;

    // The old subtree is tombstoned: the write reports success but goes
    // nowhere.
    old_cfg.insert("z", 3)?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "cfg": { "y": 2 } }));
    assert_eq!(old_cfg.get("z"), None);
    Ok(())
}

#[test]
fn validation_rejects_non_finite_numbers() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);

    let err = root.insert("bad", f64::NAN).unwrap_err();
    let MirrorError::Validation { path, .. } = &err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(path, "data/bad");

    // Nested: the path points into the rejected value.
    let err = root
        .insert("xs", vec![Value::I64(1), Value::Double(f64::INFINITY)])
        .unwrap_err();
    let MirrorError::Validation { path, .. } = &err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(path, "data/xs/1");

    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({}));
    Ok(())
}

#[test]
fn out_of_bound_list_writes_error() -> anyhow::Result<()> {
    let (_doc, mirror) = map_mirror();
    mirror.bootstrap(json!({ "xs": [1] }))?;
    let xs = list_at(&root_map(&mirror), "xs");
    assert!(matches!(
        xs.set(5, 9).unwrap_err(),
        MirrorError::OutOfBound { pos: 5, len: 1 }
    ));
    assert!(matches!(
        xs.delete(0, 2).unwrap_err(),
        MirrorError::OutOfBound { .. }
    ));
    Ok(())
}

#[test]
fn remote_list_edits_preserve_proxy_identity() -> anyhow::Result<()> {
    let doc_a = LoroDoc::new();
    let mirror_a = Mirror::new(&doc_a, doc_a.get_map("data"))?;
    mirror_a.bootstrap(json!({ "xs": [1, 2, 3] }))?;

    let doc_b = LoroDoc::new();
    let mirror_b = Mirror::new(&doc_b, doc_b.get_map("data"))?;
    sync(&doc_a, &doc_b);

    let xs_b = list_at(&root_map(&mirror_b), "xs");
    assert_eq!(xs_b.to_value().to_json_value(), json!([1, 2, 3]));

    let xs_a = list_at(&root_map(&mirror_a), "xs");
    xs_a.delete(0, 1)?;
    xs_a.push(4)?;
    mirror_a.commit()?;
    sync(&doc_a, &doc_b);

    // The same handle observes the reconciled state in place.
    assert_eq!(xs_b.to_value().to_json_value(), json!([2, 3, 4]));
    assert_eq!(xs_b, list_at(&root_map(&mirror_b), "xs"));
    Ok(())
}

#[test]
fn subscribers_see_local_and_remote_changes() -> anyhow::Result<()> {
    let doc_a = LoroDoc::new();
    let mirror_a = Mirror::new(&doc_a, doc_a.get_map("data"))?;
    let doc_b = LoroDoc::new();
    let mirror_b = Mirror::new(&doc_b, doc_b.get_map("data"))?;

    let local = Arc::new(AtomicUsize::new(0));
    let remote = Arc::new(AtomicUsize::new(0));
    let (l, r) = (local.clone(), remote.clone());
    mirror_b.subscribe(move |source| match source {
        ChangeSource::Local => {
            l.fetch_add(1, Ordering::SeqCst);
        }
        ChangeSource::Remote => {
            r.fetch_add(1, Ordering::SeqCst);
        }
    });

    root_map(&mirror_b).insert("local", 1)?;
    mirror_b.commit()?;
    assert_eq!(local.load(Ordering::SeqCst), 1);

    root_map(&mirror_a).insert("remote", 1)?;
    mirror_a.commit()?;
    sync(&doc_a, &doc_b);
    assert!(remote.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[test]
fn binary_values_pass_through() -> anyhow::Result<()> {
    let doc_a = LoroDoc::new();
    let mirror_a = Mirror::new(&doc_a, doc_a.get_map("data"))?;
    root_map(&mirror_a).insert("blob", Value::Binary(vec![1, 2, 3]))?;
    mirror_a.commit()?;
    assert_eq!(
        mirror_a.to_value().as_map().unwrap()["blob"],
        Value::Binary(vec![1, 2, 3])
    );

    let doc_b = LoroDoc::new();
    let mirror_b = Mirror::new(&doc_b, doc_b.get_map("data"))?;
    sync(&doc_a, &doc_b);
    assert_eq!(
        mirror_b.to_value().as_map().unwrap()["blob"],
        Value::Binary(vec![1, 2, 3])
    );
    Ok(())
}

#[test]
fn text_attaches_and_stays_live() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);
    let t = synced_text("hi");
    assert!(!t.is_attached());
    root.insert("note", t.clone())?;
    mirror.commit()?;
    assert!(t.is_attached());

    // Edits through the original handle hit the document directly.
    t.insert(2, "!")?;
    assert_eq!(root_json(&doc), json!({ "note": "hi!" }));

    // Reads return the live handle, not a copy.
    let read_back = root.get("note").unwrap().into_text().unwrap();
    assert_eq!(read_back.to_string(), "hi!");
    read_back.insert(0, ">")?;
    assert_eq!(t.to_string(), ">hi!");
    Ok(())
}

#[test]
fn text_syncs_to_remote_peers() -> anyhow::Result<()> {
    let doc_a = LoroDoc::new();
    let mirror_a = Mirror::new(&doc_a, doc_a.get_map("data"))?;
    let t = synced_text("shared");
    root_map(&mirror_a).insert("note", t.clone())?;
    mirror_a.commit()?;

    let doc_b = LoroDoc::new();
    let mirror_b = Mirror::new(&doc_b, doc_b.get_map("data"))?;
    sync(&doc_a, &doc_b);

    let note_b = root_map(&mirror_b)
        .get("note")
        .unwrap()
        .into_text()
        .unwrap();
    assert_eq!(note_b.to_string(), "shared");

    note_b.insert(0, "b:")?;
    doc_b.commit();
    sync(&doc_b, &doc_a);
    assert_eq!(t.to_string(), "b:shared");
    Ok(())
}

#[test]
fn dispose_commits_pending_and_drops_later_writes() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);
    root.insert("a", 1)?;
    mirror.dispose();
    assert_eq!(root_json(&doc), json!({ "a": 1 }));

    root.insert("b", 2)?;
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "a": 1 }));
    assert_eq!(mirror.to_value(), Value::Null);
    Ok(())
}

#[test]
fn list_root_mirrors() -> anyhow::Result<()> {
    let doc = LoroDoc::new();
    let mirror = Mirror::new(&doc, doc.get_list("rows"))?;
    let rows = mirror.root().into_list().unwrap();
    rows.push(json!({ "id": 1 }))?;
    rows.push(json!({ "id": 2 }))?;
    mirror.commit()?;
    assert_eq!(
        doc.get_list("rows").get_deep_value().to_json_value(),
        json!([{ "id": 1 }, { "id": 2 }])
    );
    Ok(())
}

#[test]
fn foreign_doc_writes_reconcile_like_remote_ones() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    let root = root_map(&mirror);
    // A write made directly on the doc, outside the mirror.
    doc.get_map("data").insert("direct", 7)?;
    doc.commit();
    assert_eq!(root.to_value().to_json_value(), json!({ "direct": 7 }));

    // It also gets flushed ahead of a mirror commit when still pending.
    doc.get_map("data").insert("pending", 8)?;
    root.insert("mine", 9)?;
    mirror.commit()?;
    assert_eq!(
        root_json(&doc),
        json!({ "direct": 7, "pending": 8, "mine": 9 })
    );
    assert_eq!(
        mirror.to_value().to_json_value(),
        json!({ "direct": 7, "pending": 8, "mine": 9 })
    );
    Ok(())
}

#[test]
fn reparent_mid_batch_leaves_other_writes_intact() -> anyhow::Result<()> {
    let (doc, mirror) = map_mirror();
    mirror.bootstrap(json!({ "n": 1 }))?;
    let root = root_map(&mirror);

    // The rejected assignment never enters the batch; the rest of the
    // burst commits normally.
    let t = synced_text("x");
    root.insert("p", t.clone())?;
    root.insert("n", 2)?;
    let reparent = root.insert("q", t.clone()).unwrap_err();
    assert!(matches!(reparent, MirrorError::Reparent { .. }));
    mirror.commit()?;
    assert_eq!(root_json(&doc), json!({ "n": 2, "p": "x" }));
    assert_eq!(
        mirror.to_value().to_json_value(),
        json!({ "n": 2, "p": "x" })
    );
    Ok(())
}
