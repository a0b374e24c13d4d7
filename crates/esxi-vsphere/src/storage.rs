//! Datastore inventory via the vSphere REST API.

use crate::error::VsphereResult;
use crate::types::*;
use crate::vsphere::VsphereClient;

/// Datastore lookups.
pub struct StorageManager<'a> {
    client: &'a VsphereClient,
}

impl<'a> StorageManager<'a> {
    pub fn new(client: &'a VsphereClient) -> Self {
        Self { client }
    }

    /// List datastores, optionally filtered by exact name.
    pub async fn list_datastores(&self, names: Option<&[&str]>) -> VsphereResult<Vec<DatastoreSummary>> {
        self.client.list("/api/vcenter/datastore", names.unwrap_or_default()).await
    }

    /// Find a datastore by name.
    pub async fn find_datastore_by_name(&self, name: &str) -> VsphereResult<Option<DatastoreSummary>> {
        let found = self.list_datastores(Some(&[name])).await?;
        Ok(found.into_iter().find(|d| d.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_datastore_summary_parses() {
        let ds: Vec<DatastoreSummary> = serde_json::from_str(
            r#"[{"datastore":"datastore-11","name":"ssd01","type":"VMFS","free_space":1024,"capacity":4096}]"#,
        )
        .unwrap();
        assert_eq!(ds[0].ds_type.as_deref(), Some("VMFS"));
        assert_eq!(ds[0].free_space, Some(1024));
    }
}
