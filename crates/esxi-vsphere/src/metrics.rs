//! Performance counters via the vim25 `PerformanceManager`.
//!
//! The REST API has no real-time metrics endpoint, so quick stats come from
//! the property collector and counter samples from `QueryPerf`.

use crate::error::{VsphereError, VsphereResult};
use crate::soap::{decode_perf_counters, decode_perf_series, ObjectSelection, SoapClient};
use crate::types::*;
use crate::xml::moref;

/// Realtime sampling interval, in seconds.
const REALTIME_INTERVAL_ID: u32 = 20;

/// Performance / metrics helper.
pub struct MetricsManager<'a> {
    soap: &'a SoapClient,
}

impl<'a> MetricsManager<'a> {
    pub fn new(soap: &'a SoapClient) -> Self {
        Self { soap }
    }

    fn perf_manager(&self) -> VsphereResult<ObjectRef> {
        self.soap
            .content()?
            .perf_manager
            .clone()
            .ok_or_else(|| VsphereError::not_found("Endpoint exposes no PerformanceManager"))
    }

    /// Every counter the endpoint knows about.
    pub async fn perf_counters(&self) -> VsphereResult<Vec<PerfCounterInfo>> {
        let pm = self.perf_manager()?;
        let found = self
            .soap
            .retrieve(&ObjectSelection::Objects(std::slice::from_ref(&pm)), &[pm.kind.as_str()], &["perfCounter"])
            .await?;
        Ok(decode_perf_counters(found.first().and_then(|p| p.get("perfCounter"))))
    }

    /// Latest realtime sample for each counter, across all instances.
    pub async fn query_latest(&self, entity: &ObjectRef, counter_ids: &[i32]) -> VsphereResult<Vec<PerfSeries>> {
        if counter_ids.is_empty() {
            return Ok(Vec::new());
        }
        let pm = self.perf_manager()?;
        let resp = self
            .soap
            .invoke("QueryPerf", &pm, &query_spec_xml(entity, counter_ids), None)
            .await?;
        Ok(decode_perf_series(&resp))
    }
}

/// `PerfQuerySpec` for one entity, elements in schema order.
pub(crate) fn query_spec_xml(entity: &ObjectRef, counter_ids: &[i32]) -> String {
    let metrics: String = counter_ids
        .iter()
        .map(|id| format!("<metricId><counterId>{id}</counterId><instance>*</instance></metricId>"))
        .collect();
    format!(
        "<querySpec>{}<maxSample>1</maxSample>{metrics}<intervalId>{REALTIME_INTERVAL_ID}</intervalId></querySpec>",
        moref("entity", entity)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_xml;

    #[test]
    fn query_spec_requests_every_instance() {
        let xml = query_spec_xml(&ObjectRef::new("VirtualMachine", "vm-42"), &[143, 144]);
        assert_eq!(xml.matches("<instance>*</instance>").count(), 2);
        assert!(xml.find("<maxSample>").unwrap() < xml.find("<metricId>").unwrap());
        assert!(xml.ends_with("<intervalId>20</intervalId></querySpec>"));
    }

    #[test]
    fn perf_series_decode() {
        let doc = parse_xml(
            r#"<QueryPerfResponse><returnval>
                 <entity type="VirtualMachine">vm-42</entity>
                 <value><id><counterId>143</counterId><instance>4000</instance></id><value>12</value></value>
                 <value><id><counterId>143</counterId><instance></instance></id><value>30</value></value>
                 <value><id><counterId>144</counterId><instance></instance></id><value>7</value></value>
               </returnval></QueryPerfResponse>"#,
        )
        .unwrap();
        let series = decode_perf_series(doc.child("QueryPerfResponse").unwrap());
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].instance, "4000");
        assert_eq!(series[2].values, vec![7]);
    }
}
