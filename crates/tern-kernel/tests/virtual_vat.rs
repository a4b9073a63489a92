//! A vat whose working state lives entirely in virtual objects: the
//! dispatch holds object references, the manager pages state through a
//! two-slot cache, and dropped objects are collected between deliveries.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tern_kernel::{Kernel, KernelError, SlotId, Syscall, VatDispatch};
use tern_marshal::Value;
use tern_store::{MemVatstore, Vatstore};
use tern_vobj::{
    Kind, KindSpec, MethodTable, ObjectRef, RefCountCollector, VirtualObjectManager, VomConfig,
};

struct LedgerVat {
    mgr: VirtualObjectManager,
    counter: Kind,
    roster: HashMap<String, ObjectRef>,
    log: Rc<RefCell<Vec<String>>>,
}

#[derive(Deserialize)]
struct AddArgs {
    name: String,
    by: i64,
}

impl LedgerVat {
    fn new(store: MemVatstore, log: Rc<RefCell<Vec<String>>>) -> Result<Self> {
        let mut mgr = VirtualObjectManager::new(
            Arc::new(store),
            Box::new(RefCountCollector::new()),
            VomConfig { cache_size: 2 },
        )?;
        let counter = mgr.define_kind(KindSpec::single(
            "counter",
            |_args| Ok(BTreeMap::from([("total".to_string(), Value::Int(0))])),
            MethodTable::new().method("add", |ctx, args| {
                let next = ctx.get("total")?.as_int().unwrap_or(0) + args.as_int().unwrap_or(1);
                ctx.set("total", Value::Int(next))?;
                Ok(Value::Int(next))
            }),
        ))?;
        Ok(Self { mgr, counter, roster: HashMap::new(), log })
    }

    fn note(&self, line: String) {
        self.log.borrow_mut().push(line);
    }
}

impl VatDispatch for LedgerVat {
    fn deliver(
        &mut self,
        syscall: &mut Syscall<'_>,
        _facet_id: SlotId,
        method: &str,
        args: &str,
        _slots: &[SlotId],
    ) -> Result<(), KernelError> {
        let vat = syscall.vat_id().to_string();
        match method {
            "make" => {
                let made = self
                    .mgr
                    .make_instance(self.counter, Value::Null)
                    .map_err(|err| KernelError::dispatch(&vat, err))?;
                let item = made
                    .single()
                    .cloned()
                    .ok_or_else(|| KernelError::dispatch(&vat, "counter kind is single"))?;
                self.note(format!("made {args} at {}", item.vref()));
                self.roster.insert(args.to_string(), item);
            }
            "add" => {
                let parsed: AddArgs =
                    serde_json::from_str(args).map_err(|err| KernelError::dispatch(&vat, err))?;
                let target = self.roster.get(&parsed.name).cloned().ok_or_else(|| {
                    KernelError::dispatch(&vat, format!("unknown counter {}", parsed.name))
                })?;
                let total = self
                    .mgr
                    .invoke(&target, "add", Value::Int(parsed.by))
                    .map_err(|err| KernelError::dispatch(&vat, err))?;
                self.note(format!("{}={}", parsed.name, total.as_int().unwrap_or(0)));
            }
            "drop" => {
                let Some(target) = self.roster.remove(args) else {
                    return Err(KernelError::dispatch(&vat, format!("unknown counter {args}")));
                };
                self.mgr.release(&target);
                let deleted =
                    self.mgr.collect().map_err(|err| KernelError::dispatch(&vat, err))?;
                self.note(format!("dropped {args} ({deleted} deleted)"));
            }
            "audit" => {
                // Follow-on messages land behind everything already queued.
                syscall.send(1, "audited", "", &[])?;
            }
            "audited" => {
                self.note(format!("audit ok in {vat}"));
            }
            other => return Err(KernelError::dispatch(&vat, format!("no method {other}"))),
        }
        Ok(())
    }
}

#[test]
fn virtual_objects_back_a_vat() -> Result<()> {
    let store = MemVatstore::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut kernel = Kernel::new();
    kernel.add_vat("ledger", Box::new(LedgerVat::new(store.clone(), log.clone())?));

    for name in ["a", "b", "c", "d"] {
        kernel.queue("ledger", 1, "make", name);
    }
    kernel.queue("ledger", 1, "add", r#"{"name":"a","by":2}"#);
    kernel.queue("ledger", 1, "add", r#"{"name":"b","by":5}"#);
    kernel.queue("ledger", 1, "add", r#"{"name":"a","by":1}"#);
    kernel.queue("ledger", 1, "audit", "");
    kernel.queue("ledger", 1, "drop", "c");
    kernel.run()?;

    let lines = log.borrow();
    assert_eq!(
        *lines,
        vec![
            "made a at o+1/1",
            "made b at o+1/2",
            "made c at o+1/3",
            "made d at o+1/4",
            "a=2",
            "b=5",
            "a=3",
            "dropped c (1 deleted)",
            "audit ok in ledger",
        ],
    );

    // the cache is two slots wide, so every survivor's state must be
    // reloadable from storage
    assert!(store.get("vom.o+1/1")?.is_some());
    assert!(store.get("vom.o+1/2")?.is_some());
    assert!(store.get("vom.o+1/4")?.is_some());
    assert!(store.get("vom.o+1/3")?.is_none(), "dropped counter is deleted");
    Ok(())
}
