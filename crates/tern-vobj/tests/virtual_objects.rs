use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tern_marshal::{Value, serialize};
use tern_store::{MemVatstore, Vatstore};
use tern_vobj::{
    FacetSet, KindSpec, MethodTable, ObjectRef, RefCountCollector, VirtualObjectManager,
    VomConfig,
};

fn manager(store: &MemVatstore, cache_size: usize) -> VirtualObjectManager {
    VirtualObjectManager::new(
        Arc::new(store.clone()),
        Box::new(RefCountCollector::new()),
        VomConfig { cache_size },
    )
    .expect("fresh store")
}

fn single(facets: FacetSet) -> ObjectRef {
    facets.single().cloned().expect("single-facet kind")
}

fn holder_spec() -> KindSpec {
    KindSpec::single(
        "holder",
        |args| Ok(BTreeMap::from([("item".to_string(), args)])),
        MethodTable::new().method("item", |ctx, _args| ctx.get("item")),
    )
}

fn account_spec() -> KindSpec {
    let facets = BTreeMap::from([
        (
            "teller".to_string(),
            MethodTable::new().method("deposit", |ctx, args| {
                let next =
                    ctx.get("balance")?.as_int().unwrap_or(0) + args.as_int().unwrap_or(0);
                ctx.set("balance", Value::Int(next))?;
                Ok(Value::Int(next))
            }),
        ),
        (
            "auditor".to_string(),
            MethodTable::new().method("balance", |ctx, _args| ctx.get("balance")),
        ),
    ]);
    KindSpec::faceted(
        "account",
        |_args| Ok(BTreeMap::from([("balance".to_string(), Value::Int(0))])),
        facets,
    )
}

#[test]
fn facets_share_state_through_eviction() -> Result<()> {
    let store = MemVatstore::new();
    let mut mgr = manager(&store, 2);
    let account = mgr.define_kind(account_spec())?;

    let mut tellers = Vec::new();
    let mut auditors = Vec::new();
    for _ in 0..3 {
        let made = mgr.make_instance(account, Value::Null)?;
        tellers.push(made.facet("teller").cloned().unwrap());
        auditors.push(made.facet("auditor").cloned().unwrap());
    }
    assert_eq!(mgr.resident_count(), 2, "three accounts page through two cache slots");

    for (index, teller) in tellers.iter().enumerate() {
        mgr.invoke(teller, "deposit", Value::Int(100 + index as i64))?;
    }
    assert_eq!(mgr.invoke(&auditors[0], "balance", Value::Null)?, Value::Int(100));
    assert_eq!(mgr.invoke(&auditors[1], "balance", Value::Null)?, Value::Int(101));
    assert_eq!(mgr.invoke(&auditors[2], "balance", Value::Null)?, Value::Int(102));

    // distinct facet handles, one instance behind them
    assert_eq!(tellers[0].base_ref(), auditors[0].base_ref());
    assert_ne!(tellers[0].vref(), auditors[0].vref());
    Ok(())
}

#[test]
fn references_reanimate_released_objects() -> Result<()> {
    let store = MemVatstore::new();
    let mut mgr = manager(&store, 4);
    let holder = mgr.define_kind(holder_spec())?;

    let kept = single(mgr.make_instance(holder, Value::from("payload"))?);
    let vref = kept.vref();
    assert!(mgr.is_represented(&kept.base_ref()));
    assert_eq!(mgr.rep_count(&kept.base_ref()), 1);

    // the consistency probe leaves representative accounting alone
    mgr.reanimate_pro_forma(&vref)?;
    assert_eq!(mgr.rep_count(&kept.base_ref()), 1);

    mgr.release(&kept);
    assert!(!mgr.is_represented(&kept.base_ref()));

    // decoding a payload that names the object brings it back
    let data = serialize(&Value::Ref(vref.clone()))?;
    let value = mgr.unserialize_value(&data)?;
    assert_eq!(value, Value::Ref(vref.clone()));
    assert!(mgr.is_represented(&kept.base_ref()));

    let revived = ObjectRef::from_vref(&vref)?;
    assert_eq!(mgr.invoke(&revived, "item", Value::Null)?, Value::from("payload"));
    Ok(())
}

#[test]
fn reference_cycles_survive_until_broken() -> Result<()> {
    let store = MemVatstore::new();
    let mut mgr = manager(&store, 8);
    let holder = mgr.define_kind(holder_spec())?;

    let root = single(mgr.make_instance(holder, Value::Null)?);
    let a = single(mgr.make_instance(holder, Value::Null)?);
    let b = single(mgr.make_instance(holder, Value::Null)?);

    mgr.set_property(&a, "item", Value::Ref(b.vref()))?;
    mgr.set_property(&b, "item", Value::Ref(a.vref()))?;
    mgr.set_property(&root, "item", Value::Ref(a.vref()))?;

    mgr.release(&a);
    assert_eq!(mgr.collect()?, 0, "a is held by root and by the cycle");

    mgr.set_property(&root, "item", Value::Null)?;
    assert_eq!(mgr.collect()?, 0, "the cycle keeps itself alive");
    let a_key = format!("vom.{}", a.base_ref());
    let b_key = format!("vom.{}", b.base_ref());
    assert!(store.get(&a_key)?.is_some());

    // breaking one edge lets the cascade take the unrepresented member
    mgr.set_property(&b, "item", Value::Null)?;
    assert_eq!(mgr.collect()?, 1);
    assert!(store.get(&a_key)?.is_none());
    assert!(store.get(&b_key)?.is_some(), "b is still represented");

    mgr.release(&b);
    assert_eq!(mgr.collect()?, 1);
    assert!(store.get(&b_key)?.is_none());
    Ok(())
}

#[test]
fn weak_membership_does_not_keep_objects_alive() -> Result<()> {
    let store = MemVatstore::new();
    let mut mgr = manager(&store, 4);
    let holder = mgr.define_kind(holder_spec())?;

    let fleeting = single(mgr.make_instance(holder, Value::Null)?);
    let seen = mgr.make_weak_set();
    mgr.weak_set_add(seen, &Value::Ref(fleeting.vref()))?;

    mgr.release(&fleeting);
    assert_eq!(mgr.collect()?, 1, "recognition is not reachability");
    assert!(store.get(&format!("vom.{}", fleeting.base_ref()))?.is_none());
    Ok(())
}
