//! ESXi host inventory.

use crate::error::VsphereResult;
use crate::soap::SoapClient;
use crate::types::*;
use crate::vsphere::VsphereClient;

/// ESXi host lookups.
pub struct HostManager<'a> {
    soap: &'a SoapClient,
    rest: Option<&'a VsphereClient>,
}

impl<'a> HostManager<'a> {
    pub fn new(soap: &'a SoapClient, rest: Option<&'a VsphereClient>) -> Self {
        Self { soap, rest }
    }

    /// List hosts, optionally filtered by exact name.
    ///
    /// A standalone ESXi host has no REST inventory, so the property
    /// collector answers instead.
    pub async fn list_hosts(&self, names: Option<&[&str]>) -> VsphereResult<Vec<HostSummary>> {
        if let Some(rest) = self.rest {
            return rest.list("/api/vcenter/host", names.unwrap_or_default()).await;
        }

        let found = self
            .soap
            .retrieve_kind("HostSystem", &["name", "runtime.connectionState", "runtime.powerState"])
            .await?;
        Ok(found
            .iter()
            .filter_map(host_summary_from_props)
            .filter(|h| names.map_or(true, |ns| ns.contains(&h.name.as_str())))
            .collect())
    }
}

fn host_summary_from_props(p: &ObjectProperties) -> Option<HostSummary> {
    Some(HostSummary {
        host: p.obj.value.clone(),
        name: p.str("name")?.to_string(),
        connection_state: p.str("runtime.connectionState").map(str::to_string),
        power_state: p.str("runtime.powerState").map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_host_summary_parses() {
        let hosts: Vec<HostSummary> = serde_json::from_str(
            r#"[{"host":"host-10","name":"esx01.lab","connection_state":"CONNECTED","power_state":"POWERED_ON"}]"#,
        )
        .unwrap();
        assert_eq!(hosts[0].host, "host-10");
        assert_eq!(hosts[0].connection_state.as_deref(), Some("CONNECTED"));
    }

    #[test]
    fn summary_requires_a_name() {
        let p = ObjectProperties { obj: ObjectRef::new("HostSystem", "ha-host"), props: serde_json::Map::new() };
        assert!(host_summary_from_props(&p).is_none());
    }
}
