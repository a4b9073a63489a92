use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tern_marshal::{Value, Vref};
use tern_store::{FsVatstore, MemVatstore, Vatstore};
use tern_vobj::{
    FacetSet, KindSpec, MethodTable, ObjectRef, RefCountCollector, VirtualObjectManager,
    VobjError, VomConfig,
};

fn manager(store: Arc<dyn Vatstore>) -> Result<VirtualObjectManager> {
    Ok(VirtualObjectManager::new(
        store,
        Box::new(RefCountCollector::new()),
        VomConfig::default(),
    )?)
}

fn single(facets: FacetSet) -> ObjectRef {
    facets.single().cloned().expect("single-facet kind")
}

fn counter_spec() -> KindSpec {
    KindSpec::single(
        "counter",
        |args| {
            Ok(BTreeMap::from([(
                "total".to_string(),
                Value::Int(args.as_int().unwrap_or(0)),
            )]))
        },
        MethodTable::new()
            .method("bump", |ctx, _args| {
                let next = ctx.get("total")?.as_int().unwrap_or(0) + 1;
                ctx.set("total", Value::Int(next))?;
                Ok(Value::Int(next))
            })
            .method("read", |ctx, _args| ctx.get("total")),
    )
}

fn registry_spec() -> KindSpec {
    KindSpec::single(
        "registry",
        |args| {
            let Value::Record(fields) = args else {
                return Err(VobjError::method("registry init wants a record"));
            };
            let pick = |name: &str| fields.get(name).cloned().unwrap_or(Value::Null);
            Ok(BTreeMap::from([
                ("counterKind".to_string(), pick("counterKind")),
                ("main".to_string(), pick("main")),
            ]))
        },
        MethodTable::new(),
    )
}

fn stored_vref(store: &FsVatstore, key: &str) -> Result<Vref> {
    let bytes = store.get(key)?.with_context(|| format!("missing root key {key}"))?;
    Ok(String::from_utf8(bytes)?.parse()?)
}

#[test]
fn durable_kinds_reconnect_across_restart() -> Result<()> {
    let dir = TempDir::new()?;

    // First incarnation: define durable kinds, persist a registry that
    // names the counter kind handle and the main counter instance.
    {
        let store = Arc::new(FsVatstore::open(dir.path())?);
        let mut mgr = manager(store.clone())?;
        mgr.initialize_kind_handle_kind()?;

        let registry_handle = mgr.make_kind_handle("registry")?;
        let counter_handle = mgr.make_kind_handle("counter")?;
        let registry_kind = mgr.define_durable_kind(&registry_handle, registry_spec())?;
        let counter_kind = mgr.define_durable_kind(&counter_handle, counter_spec())?;
        mgr.insist_all_durable_kinds_reconnected()?;

        let main = single(mgr.make_instance(counter_kind, Value::Int(40))?);
        let _spare = single(mgr.make_instance(counter_kind, Value::Int(0))?);
        assert_eq!(mgr.invoke(&main, "bump", Value::Null)?, Value::Int(41));

        let registry = single(mgr.make_instance(
            registry_kind,
            Value::record([
                ("counterKind", Value::Ref(counter_handle.vref().clone())),
                ("main", Value::Ref(main.vref())),
            ]),
        )?);

        store.set("root.registryKind", registry_handle.vref().to_string().as_bytes())?;
        store.set("root.registry", registry.vref().to_string().as_bytes())?;
        mgr.flush_cache()?;
    }

    // Second incarnation: everything is recovered from storage, nothing guessed.
    {
        let store = Arc::new(FsVatstore::open(dir.path())?);
        let mut mgr = manager(store.clone())?;
        mgr.initialize_kind_handle_kind()?;

        let err = mgr.insist_all_durable_kinds_reconnected().unwrap_err();
        assert!(matches!(
            &err,
            VobjError::DurableKindsNotReconnected { tags } if *tags == ["registry", "counter"]
        ));

        let registry_handle = mgr.kind_handle(&stored_vref(&store, "root.registryKind")?)?;
        assert_eq!(mgr.kind_tag(&registry_handle)?, "registry");
        mgr.define_durable_kind(&registry_handle, registry_spec())?;
        let err = mgr.insist_all_durable_kinds_reconnected().unwrap_err();
        assert!(matches!(
            &err,
            VobjError::DurableKindsNotReconnected { tags } if *tags == ["counter"]
        ));

        // Persisted instances have no behavior until their kind is redefined.
        let main_guess = ObjectRef::from_vref(&"o+3/1".parse::<Vref>()?)?;
        assert!(matches!(
            mgr.invoke(&main_guess, "read", Value::Null),
            Err(VobjError::UnknownKind(3)),
        ));

        let registry = ObjectRef::from_vref(&stored_vref(&store, "root.registry")?)?;
        let Value::Ref(handle_vref) = mgr.get_property(&registry, "counterKind")? else {
            panic!("counterKind is a reference");
        };
        let counter_handle = mgr.kind_handle(&handle_vref)?;
        assert_eq!(mgr.kind_tag(&counter_handle)?, "counter");
        let counter_kind = mgr.define_durable_kind(&counter_handle, counter_spec())?;
        mgr.insist_all_durable_kinds_reconnected()?;

        let Value::Ref(main_vref) = mgr.get_property(&registry, "main")? else {
            panic!("main is a reference");
        };
        let main = ObjectRef::from_vref(&main_vref)?;
        assert_eq!(mgr.invoke(&main, "read", Value::Null)?, Value::Int(41));
        assert_eq!(mgr.invoke(&main, "bump", Value::Null)?, Value::Int(42));

        // Instance numbering resumes past everything already stored.
        let fresh = single(mgr.make_instance(counter_kind, Value::Int(0))?);
        assert_eq!(fresh.vref().to_string(), "o+3/3");

        // Fresh definitions never collide with recovered kind ids.
        let scratch = mgr.define_kind(counter_spec())?;
        assert_eq!(scratch.id(), 4);
    }
    Ok(())
}

#[test]
fn durable_state_rejects_non_durable_references() -> Result<()> {
    let store = MemVatstore::new();
    let mut mgr = manager(Arc::new(store.clone()))?;
    mgr.initialize_kind_handle_kind()?;

    let vault_handle = mgr.make_kind_handle("vault")?;
    let vault = mgr.define_durable_kind(
        &vault_handle,
        KindSpec::single(
            "vault",
            |args| Ok(BTreeMap::from([("item".to_string(), args)])),
            MethodTable::new(),
        ),
    )?;
    let scratch = mgr.define_kind(KindSpec::single(
        "scratch",
        |args| Ok(BTreeMap::from([("item".to_string(), args)])),
        MethodTable::new(),
    ))?;

    let ephemeral = single(mgr.make_instance(scratch, Value::Null)?);

    // Construction with an ephemeral slot fails and counts nothing.
    let err = mgr
        .make_instance(vault, Value::Ref(ephemeral.vref()))
        .unwrap_err();
    assert!(matches!(
        &err,
        VobjError::DurabilityViolation { prop, slot, .. }
            if prop == "item" && *slot == ephemeral.vref()
    ));
    assert!(!mgr.collector().is_reachable(&ephemeral.vref()));

    // Durable-to-durable storage is fine, including kind handles.
    let keeper = single(mgr.make_instance(vault, Value::Null)?);
    let other = single(mgr.make_instance(vault, Value::Ref(keeper.vref()))?);
    mgr.set_property(&other, "item", Value::Ref(vault_handle.vref().clone()))?;

    // Writes are checked the same way construction is.
    let err = mgr
        .set_property(&other, "item", Value::Ref(ephemeral.vref()))
        .unwrap_err();
    assert!(matches!(&err, VobjError::DurabilityViolation { .. }));

    // Vat imports are never durable.
    let err = mgr
        .set_property(&other, "item", Value::Ref(Vref::Import(4)))
        .unwrap_err();
    assert!(matches!(
        &err,
        VobjError::DurabilityViolation { slot, .. } if *slot == Vref::Import(4)
    ));
    Ok(())
}
