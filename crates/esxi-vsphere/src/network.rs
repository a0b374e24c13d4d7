//! Network and port-group inventory via the vSphere REST API.

use crate::error::VsphereResult;
use crate::types::*;
use crate::vsphere::VsphereClient;

/// Network / port-group lookups.
pub struct NetworkManager<'a> {
    client: &'a VsphereClient,
}

impl<'a> NetworkManager<'a> {
    pub fn new(client: &'a VsphereClient) -> Self {
        Self { client }
    }

    /// List networks, optionally filtered by exact name.
    pub async fn list_networks(&self, names: Option<&[&str]>) -> VsphereResult<Vec<NetworkSummary>> {
        self.client.list("/api/vcenter/network", names.unwrap_or_default()).await
    }

    /// Find a network by name, typed the way vim25 types it.
    pub async fn find_network_by_name(&self, name: &str) -> VsphereResult<Option<ObjectRef>> {
        let found = self.list_networks(Some(&[name])).await?;
        Ok(found
            .into_iter()
            .find(|n| n.name == name)
            .map(|n| ObjectRef::named(vim_network_kind(n.network_type.as_deref()), n.network, n.name)))
    }
}

/// REST network type to vim25 managed object type.
pub(crate) fn vim_network_kind(rest_type: Option<&str>) -> &'static str {
    match rest_type {
        Some("DISTRIBUTED_PORTGROUP") => "DistributedVirtualPortgroup",
        Some("OPAQUE_NETWORK") => "OpaqueNetwork",
        _ => "Network",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributed_port_groups_map_to_vim_kind() {
        assert_eq!(vim_network_kind(Some("DISTRIBUTED_PORTGROUP")), "DistributedVirtualPortgroup");
        assert_eq!(vim_network_kind(Some("STANDARD_PORTGROUP")), "Network");
        assert_eq!(vim_network_kind(None), "Network");
    }

    #[test]
    fn rest_network_summary_parses() {
        let nets: Vec<NetworkSummary> =
            serde_json::from_str(r#"[{"network":"dvportgroup-21","name":"prod","type":"DISTRIBUTED_PORTGROUP"}]"#)
                .unwrap();
        assert_eq!(nets[0].network_type.as_deref(), Some("DISTRIBUTED_PORTGROUP"));
    }
}
