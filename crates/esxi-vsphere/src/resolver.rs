//! Remote handle resolver: human-readable name to managed object reference.
//!
//! On vCenter the REST API answers with a server-side `names=` filter. Kinds
//! REST does not model, and every kind on a standalone ESXi host, go through
//! the property collector.

use crate::api::VsphereApi;
use crate::error::VsphereResult;
use crate::host::HostManager;
use crate::network::NetworkManager;
use crate::storage::StorageManager;
use crate::types::*;
use crate::vm::VmManager;
use crate::vsphere::VsphereClient;

use serde_json::Value;

pub(crate) async fn resolve(api: &VsphereApi, kind: ObjectKind, name: &str) -> VsphereResult<Option<ObjectRef>> {
    let found = match api.rest() {
        Some(rest) => resolve_rest(api, rest, kind, name).await?,
        None => resolve_by_property(api, kind, name).await?,
    };
    match &found {
        Some(obj) => log::debug!("Resolved {kind} '{name}' to {}", obj.value),
        None => log::debug!("{kind} '{name}' not found"),
    }
    Ok(found)
}

async fn resolve_rest(
    api: &VsphereApi,
    rest: &VsphereClient,
    kind: ObjectKind,
    name: &str,
) -> VsphereResult<Option<ObjectRef>> {
    let names = [name];
    let obj = match kind {
        ObjectKind::VirtualMachine => VmManager::new(api.soap(), Some(rest))
            .list_vms_named(Some(&names))
            .await?
            .into_iter()
            .find(|v| v.name == name)
            .map(|v| ObjectRef::named(kind.as_str(), v.vm, v.name)),
        ObjectKind::HostSystem => HostManager::new(api.soap(), Some(rest))
            .list_hosts(Some(&names))
            .await?
            .into_iter()
            .find(|h| h.name == name)
            .map(|h| ObjectRef::named(kind.as_str(), h.host, h.name)),
        ObjectKind::Datastore => StorageManager::new(rest)
            .find_datastore_by_name(name)
            .await?
            .map(|d| ObjectRef::named(kind.as_str(), d.datastore, d.name)),
        ObjectKind::Network => NetworkManager::new(rest).find_network_by_name(name).await?,
        ObjectKind::Datacenter => rest_lookup(rest, kind, "/api/vcenter/datacenter", "datacenter", name).await?,
        ObjectKind::ClusterComputeResource => rest_lookup(rest, kind, "/api/vcenter/cluster", "cluster", name).await?,
        ObjectKind::Folder => rest_lookup(rest, kind, "/api/vcenter/folder", "folder", name).await?,
        ObjectKind::ResourcePool => {
            rest_lookup(rest, kind, "/api/vcenter/resource-pool", "resource_pool", name).await?
        }
        ObjectKind::StoragePod | ObjectKind::ComputeResource => resolve_by_property(api, kind, name).await?,
    };
    Ok(obj)
}

/// List endpoints that return `[{"<id_field>": "...", "name": "..."}]`.
async fn rest_lookup(
    rest: &VsphereClient,
    kind: ObjectKind,
    path: &str,
    id_field: &str,
    name: &str,
) -> VsphereResult<Option<ObjectRef>> {
    let items: Vec<Value> = rest.list(path, &[name]).await?;
    Ok(first_named(&items, id_field, name).map(|id| ObjectRef::named(kind.as_str(), id, name)))
}

fn first_named(items: &[Value], id_field: &str, name: &str) -> Option<String> {
    items
        .iter()
        .find(|i| i.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|i| i.get(id_field).and_then(Value::as_str))
        .map(str::to_string)
}

async fn resolve_by_property(api: &VsphereApi, kind: ObjectKind, name: &str) -> VsphereResult<Option<ObjectRef>> {
    let found = api.soap().retrieve_kind(kind.as_str(), &["name"]).await?;
    Ok(first_by_name(found, name))
}

/// First object whose `name` matches, keeping the concrete vim25 type
/// (a `Network` lookup may yield a `DistributedVirtualPortgroup`).
pub(crate) fn first_by_name(found: Vec<ObjectProperties>, name: &str) -> Option<ObjectRef> {
    found.into_iter().find(|p| p.str("name") == Some(name)).map(|p| ObjectRef {
        name: Some(name.to_string()),
        ..p.obj
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rest_items_match_exact_name() {
        let items = vec![
            json!({"cluster": "domain-c7", "name": "prod-east"}),
            json!({"cluster": "domain-c9", "name": "prod"}),
        ];
        assert_eq!(first_named(&items, "cluster", "prod").as_deref(), Some("domain-c9"));
        assert_eq!(first_named(&items, "cluster", "dev"), None);
    }

    #[test]
    fn property_match_keeps_concrete_type() {
        let mut props = serde_json::Map::new();
        props.insert("name".into(), json!("dvpg-prod"));
        let found = vec![ObjectProperties { obj: ObjectRef::new("DistributedVirtualPortgroup", "dvportgroup-21"), props }];
        let obj = first_by_name(found, "dvpg-prod").unwrap();
        assert_eq!(obj.kind, "DistributedVirtualPortgroup");
        assert_eq!(obj.label(), "dvpg-prod");
    }
}
