//! Reconciliation of a staged ledger into a representation
//!
//! Application order is fixed: removals and clears for every collection, then
//! additions (with slot allocation), then queued updates, then one pass that
//! drops references to entities that no longer exist.

use crate::arm::resource_id::name_from_resource_id;
use crate::ledger::Ledger;
use crate::resource::{CollectionDef, KeyMode, ReferenceDef, ResourceKindDef};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};

/// Counts of what a reconciliation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: usize,
    pub added: usize,
    pub updated: usize,
    pub cleared_references: usize,
}

/// Replay `ledger` onto `repr` for a resource of `kind`.
pub fn reconcile(repr: &mut Value, kind: &ResourceKindDef, ledger: &Ledger) -> ReconcileReport {
    let mut report = ReconcileReport {
        removed: apply_removals(repr, kind, ledger),
        ..ReconcileReport::default()
    };
    report.added = apply_additions(repr, kind, ledger);
    report.updated = apply_updates(repr, kind, ledger);
    report.cleared_references = resolve_associations(repr, kind);
    report
}

/// Key of an entity under the collection's key mode: its name, or its full
/// id lowercased for reference sets
pub fn entity_key(entity: &Value, mode: KeyMode) -> Option<String> {
    match mode {
        KeyMode::Name => entity.get("name").and_then(Value::as_str).map(str::to_string),
        KeyMode::Id => entity.get("id").and_then(Value::as_str).map(str::to_ascii_lowercase),
    }
}

/// The form a caller-supplied key is compared and staged in
pub fn normalize_key(mode: KeyMode, key: &str) -> String {
    match mode {
        KeyMode::Name => key.to_string(),
        KeyMode::Id => key.to_ascii_lowercase(),
    }
}

/// Entities of a collection, empty if the array is absent
pub fn entities<'a>(repr: &'a Value, def: &CollectionDef) -> &'a [Value] {
    repr.pointer(&def.path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Names of the entities of a collection, in representation order
pub fn entity_names(repr: &Value, def: &CollectionDef) -> Vec<String> {
    entities(repr, def)
        .iter()
        .filter_map(|e| entity_key(e, def.key))
        .collect()
}

pub fn find_entity<'a>(repr: &'a Value, def: &CollectionDef, name: &str) -> Option<&'a Value> {
    let key = normalize_key(def.key, name);
    entities(repr, def)
        .iter()
        .find(|e| entity_key(e, def.key).as_deref() == Some(key.as_str()))
}

pub fn find_entity_mut<'a>(
    repr: &'a mut Value,
    def: &CollectionDef,
    name: &str,
) -> Option<&'a mut Value> {
    let key = normalize_key(def.key, name);
    repr.pointer_mut(&def.path)?
        .as_array_mut()?
        .iter_mut()
        .find(|e| entity_key(e, def.key).as_deref() == Some(key.as_str()))
}

/// Walk to the array at `pointer`, creating objects and arrays on the way.
/// Returns `None` if a scalar sits somewhere on the path.
pub fn ensure_array<'a>(repr: &'a mut Value, pointer: &str) -> Option<&'a mut Vec<Value>> {
    ensure_path(repr, pointer, true)?.as_array_mut()
}

/// Like [`ensure_array`], for an object at the end of the path.
pub fn ensure_object<'a>(repr: &'a mut Value, pointer: &str) -> Option<&'a mut Map<String, Value>> {
    ensure_path(repr, pointer, false)?.as_object_mut()
}

fn ensure_path<'a>(repr: &'a mut Value, pointer: &str, leaf_is_array: bool) -> Option<&'a mut Value> {
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();

    let mut current = repr;
    for (i, token) in tokens.iter().enumerate() {
        let next_is_index = tokens
            .get(i + 1)
            .map(|t| t.parse::<usize>().is_ok())
            .unwrap_or(false);
        let is_last = i + 1 == tokens.len();
        let fresh = || {
            if (is_last && leaf_is_array) || (!is_last && next_is_index) {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        };

        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => {
                let slot = map.entry(token.clone()).or_insert(Value::Null);
                if slot.is_null() {
                    *slot = fresh();
                }
                slot
            }
            Value::Array(items) => {
                let idx = token.parse::<usize>().ok()?;
                while items.len() <= idx {
                    items.push(Value::Object(Map::new()));
                }
                &mut items[idx]
            }
            _ => return None,
        };
    }

    Some(current)
}

/// First-unused-slot allocation: scan upward from zero, skip occupied slots,
/// take the first `count` gaps.
pub fn allocate_slots(used: &BTreeSet<i64>, count: usize) -> Vec<i64> {
    let mut taken = used.clone();
    let mut slots = Vec::with_capacity(count);
    let mut candidate = 0;
    while slots.len() < count {
        if taken.insert(candidate) {
            slots.push(candidate);
        }
        candidate += 1;
    }
    slots
}

fn slot_of(entity: &Value, field: &str) -> Option<i64> {
    entity.get(field).and_then(Value::as_i64).filter(|s| *s >= 0)
}

/// Apply staged removals and clears; returns how many entities were dropped.
pub fn apply_removals(repr: &mut Value, kind: &ResourceKindDef, ledger: &Ledger) -> usize {
    let mut removed = 0;
    for (name, pending) in ledger.iter() {
        if !pending.clears() && pending.removes().is_empty() {
            continue;
        }
        let Some(def) = kind.collection(name) else {
            continue;
        };
        let Some(items) = repr.pointer_mut(&def.path).and_then(Value::as_array_mut) else {
            continue;
        };

        let before = items.len();
        if pending.clears() {
            items.clear();
        } else {
            items.retain(|e| {
                entity_key(e, def.key)
                    .map(|k| !pending.removes().contains(&k))
                    .unwrap_or(true)
            });
        }
        removed += before - items.len();
    }
    removed
}

/// Apply staged additions, filling slot fields where the collection has one.
pub fn apply_additions(repr: &mut Value, kind: &ResourceKindDef, ledger: &Ledger) -> usize {
    let mut added = 0;
    for (name, pending) in ledger.iter() {
        if pending.adds().is_empty() {
            continue;
        }
        let Some(def) = kind.collection(name) else {
            continue;
        };
        let Some(items) = ensure_array(repr, &def.path) else {
            tracing::warn!("collection {} is not reachable at {}", name, def.path);
            continue;
        };

        let mut payloads: Vec<(String, Value)> = pending.adds().to_vec();
        if let Some(field) = &def.slot_field {
            let used: BTreeSet<i64> = items
                .iter()
                .chain(payloads.iter().map(|(_, p)| p))
                .filter_map(|e| slot_of(e, field))
                .collect();
            let unassigned = payloads
                .iter()
                .filter(|(_, p)| slot_of(p, field).is_none())
                .count();
            let mut slots = allocate_slots(&used, unassigned).into_iter();
            for (_, payload) in payloads.iter_mut() {
                if slot_of(payload, field).is_none() {
                    if let (Some(obj), Some(slot)) = (payload.as_object_mut(), slots.next()) {
                        obj.insert(field.clone(), Value::from(slot));
                    }
                }
            }
        }

        for (entity_name, payload) in payloads {
            match items
                .iter_mut()
                .find(|e| entity_key(e, def.key).as_deref() == Some(entity_name.as_str()))
            {
                Some(existing) => *existing = payload,
                None => items.push(payload),
            }
            added += 1;
        }
    }
    added
}

/// Run queued mutators against existing entities, then the root edits.
pub fn apply_updates(repr: &mut Value, kind: &ResourceKindDef, ledger: &Ledger) -> usize {
    let mut updated = 0;
    for mutator in ledger.root_updates() {
        mutator(repr);
        updated += 1;
    }
    for (name, pending) in ledger.iter() {
        let Some(def) = kind.collection(name) else {
            continue;
        };
        for (entity_name, mutator) in pending.updates() {
            match find_entity_mut(repr, def, entity_name) {
                Some(entity) => {
                    mutator(entity);
                    updated += 1;
                }
                None => tracing::debug!("update target {}/{} is gone", name, entity_name),
            }
        }
    }
    updated
}

/// Drop every reference whose target name is missing from its collection.
/// Single references become `null`; lists lose the dangling entries.
pub fn resolve_associations(repr: &mut Value, kind: &ResourceKindDef) -> usize {
    let mut cleared = 0;
    for reference in &kind.references {
        let (Some(source), Some(target)) = (
            kind.collection(&reference.source),
            kind.collection(&reference.target),
        ) else {
            continue;
        };
        let targets: HashSet<String> = entity_names(repr, target).into_iter().collect();
        cleared += clear_dangling(repr, source, reference, target.key, &targets);
    }
    cleared
}

fn clear_dangling(
    repr: &mut Value,
    source: &CollectionDef,
    reference: &ReferenceDef,
    target_key: KeyMode,
    targets: &HashSet<String>,
) -> usize {
    let Some(items) = repr.pointer_mut(&source.path).and_then(Value::as_array_mut) else {
        return 0;
    };

    let dangling = |r: &Value| {
        r.get("id")
            .and_then(Value::as_str)
            .map(|id| match target_key {
                KeyMode::Name => !targets.contains(name_from_resource_id(id)),
                KeyMode::Id => !targets.contains(&id.to_ascii_lowercase()),
            })
            .unwrap_or(false)
    };

    let mut cleared = 0;
    for entity in items.iter_mut() {
        let Some(field) = entity.pointer_mut(&reference.field) else {
            continue;
        };
        if let Some(refs) = field.as_array_mut() {
            let before = refs.len();
            refs.retain(|r| !dangling(r));
            cleared += before - refs.len();
            continue;
        }
        if field.is_object() && dangling(field) {
            tracing::debug!(
                "clearing dangling {} reference {} -> {}",
                reference.source,
                reference.field,
                reference.target
            );
            *field = Value::Null;
            cleared += 1;
        }
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::get_kind;
    use serde_json::json;
    use std::sync::Arc;

    fn gateway() -> &'static ResourceKindDef {
        get_kind("application-gateways").unwrap()
    }

    fn scale_set() -> &'static ResourceKindDef {
        get_kind("virtual-machine-scale-sets").unwrap()
    }

    fn sub(kind: &str, name: &str) -> Value {
        json!({ "id": format!("/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/applicationGateways/ag/{}/{}", kind, name) })
    }

    #[test]
    fn test_allocate_slots_fills_gaps_first() {
        let used: BTreeSet<i64> = [0, 2, 3].into_iter().collect();
        assert_eq!(allocate_slots(&used, 2), vec![1, 4]);
        assert_eq!(allocate_slots(&BTreeSet::new(), 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_new_disks_get_lowest_free_luns() {
        let mut repr = json!({
            "properties": { "virtualMachineProfile": { "storageProfile": { "dataDisks": [
                { "name": "d0", "lun": 0 }, { "name": "d2", "lun": 2 }, { "name": "d3", "lun": 3 }
            ]}}}
        });
        let mut ledger = Ledger::new(scale_set().collection_names());
        ledger.stage_add("dataDisks", "a", json!({ "name": "a", "lun": -1 })).unwrap();
        ledger.stage_add("dataDisks", "b", json!({ "name": "b" })).unwrap();

        let report = reconcile(&mut repr, scale_set(), &ledger);
        assert_eq!(report.added, 2);

        let def = scale_set().collection("dataDisks").unwrap();
        assert_eq!(find_entity(&repr, def, "a").unwrap()["lun"], 1);
        assert_eq!(find_entity(&repr, def, "b").unwrap()["lun"], 4);
    }

    #[test]
    fn test_explicit_slots_are_reserved() {
        let mut repr = json!({});
        let mut ledger = Ledger::new(scale_set().collection_names());
        ledger.stage_add("dataDisks", "auto", json!({ "name": "auto", "lun": -1 })).unwrap();
        ledger.stage_add("dataDisks", "fixed", json!({ "name": "fixed", "lun": 0 })).unwrap();

        reconcile(&mut repr, scale_set(), &ledger);
        let def = scale_set().collection("dataDisks").unwrap();
        assert_eq!(find_entity(&repr, def, "auto").unwrap()["lun"], 1);
        assert_eq!(find_entity(&repr, def, "fixed").unwrap()["lun"], 0);
    }

    #[test]
    fn test_ensure_array_builds_indexed_paths() {
        let mut repr = json!({});
        let def = scale_set().collection("loadBalancerBackends").unwrap();
        ensure_array(&mut repr, &def.path).unwrap().push(json!({ "id": "x/pool1" }));
        assert_eq!(entity_names(&repr, def), vec!["pool1".to_string()]);
        assert!(repr.pointer("/properties/virtualMachineProfile/networkProfile/networkInterfaceConfigurations/0").is_some());
    }

    #[test]
    fn test_ensure_array_stops_at_scalars() {
        let mut repr = json!({ "properties": "oops" });
        assert!(ensure_array(&mut repr, "/properties/probes").is_none());
        assert!(ensure_object(&mut repr, "/properties/sku").is_none());
    }

    #[test]
    fn test_ensure_object_creates_nested_objects() {
        let mut repr = json!({ "name": "vmss1" });
        ensure_object(&mut repr, "/properties/upgradePolicy")
            .unwrap()
            .insert("mode".into(), json!("Automatic"));
        assert_eq!(repr["properties"]["upgradePolicy"]["mode"], "Automatic");
    }

    #[test]
    fn test_dangling_references_are_cleared() {
        let mut repr = json!({ "properties": {
            "backendAddressPools": [ { "name": "pool1" }, { "name": "pool2" } ],
            "authenticationCertificates": [ { "name": "cert1" } ],
            "backendHttpSettingsCollection": [
                { "name": "http1", "properties": {
                    "authenticationCertificates": [ sub("authenticationCertificates", "cert1"), sub("authenticationCertificates", "cert2") ]
                } }
            ],
            "requestRoutingRules": [
                { "name": "rule1", "properties": { "backendAddressPool": sub("backendAddressPools", "pool1") } },
                { "name": "rule2", "properties": { "backendAddressPool": sub("backendAddressPools", "pool2") } },
                { "name": "rule3", "properties": { "backendAddressPool": sub("backendAddressPools", "pool2") } }
            ]
        }});
        let mut ledger = Ledger::new(gateway().collection_names());
        ledger.stage_remove("backends", "pool2").unwrap();

        let report = reconcile(&mut repr, gateway(), &ledger);
        assert_eq!(report.removed, 1);
        // two rules pointed at pool2, one http config pointed at a cert that never existed
        assert_eq!(report.cleared_references, 3);

        let rules = gateway().collection("rules").unwrap();
        assert!(find_entity(&repr, rules, "rule1").unwrap()["properties"]["backendAddressPool"].is_object());
        assert!(find_entity(&repr, rules, "rule2").unwrap()["properties"]["backendAddressPool"].is_null());
        assert!(find_entity(&repr, rules, "rule3").unwrap()["properties"]["backendAddressPool"].is_null());

        let configs = gateway().collection("backendHttpConfigs").unwrap();
        let certs = &find_entity(&repr, configs, "http1").unwrap()["properties"]["authenticationCertificates"];
        assert_eq!(certs.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut repr = json!({ "properties": {
            "probes": [ { "name": "probe1" } ],
            "backendHttpSettingsCollection": [
                { "name": "http1", "properties": { "probe": sub("probes", "probe1") } }
            ]
        }});
        let mut ledger = Ledger::new(gateway().collection_names());
        ledger.stage_add("probes", "probe2", json!({ "name": "probe2" })).unwrap();
        ledger.stage_remove("probes", "probe1").unwrap();
        reconcile(&mut repr, gateway(), &ledger);

        let once = serde_json::to_string(&repr).unwrap();
        reconcile(&mut repr, gateway(), &Ledger::new(gateway().collection_names()));
        assert_eq!(serde_json::to_string(&repr).unwrap(), once);
    }

    #[test]
    fn test_clear_detaches_before_attach() {
        let def = scale_set().collection("loadBalancerBackends").unwrap();
        let mut repr = json!({});
        ensure_array(&mut repr, &def.path)
            .unwrap()
            .extend([json!({ "id": "lb-old/backendAddressPools/a" }), json!({ "id": "lb-old/backendAddressPools/b" })]);

        let mut ledger = Ledger::new(scale_set().collection_names());
        // attach staged before detach; the outcome must not depend on it
        ledger
            .stage_add(
                "loadBalancerBackends",
                "lb-new/backendaddresspools/c",
                json!({ "id": "lb-new/backendAddressPools/c" }),
            )
            .unwrap();
        ledger.stage_clear("loadBalancerBackends").unwrap();

        reconcile(&mut repr, scale_set(), &ledger);
        assert_eq!(entity_names(&repr, def), vec!["lb-new/backendaddresspools/c".to_string()]);
    }

    #[test]
    fn test_updates_run_after_additions() {
        let mut repr = json!({ "properties": { "probes": [ { "name": "probe1", "port": 80 } ] } });
        let mut ledger = Ledger::new(gateway().collection_names());
        ledger
            .stage_update("probes", "probe1", Arc::new(|p: &mut Value| p["port"] = json!(8080)))
            .unwrap();

        let report = reconcile(&mut repr, gateway(), &ledger);
        assert_eq!(report.updated, 1);
        assert_eq!(repr["properties"]["probes"][0]["port"], 8080);
    }
}
