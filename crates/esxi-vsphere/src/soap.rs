//! vim25 SOAP client.
//!
//! The REST API has no equivalent for the property collector, vim tasks or
//! the snapshot tree, so those go through `https://{host}:{port}/sdk`.
//! The session is carried by the `vmware_soap_session` cookie.

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::*;
use crate::xml::{as_list, el, moref, parse_xml, XmlNode};

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;

const SOAP_ACTION: &str = "urn:vim25/7.0.3.0";

/// References returned by `RetrieveServiceContent`.
#[derive(Debug, Clone)]
pub struct ServiceContent {
    pub root_folder: ObjectRef,
    pub property_collector: ObjectRef,
    pub view_manager: ObjectRef,
    pub session_manager: ObjectRef,
    pub perf_manager: Option<ObjectRef>,
}

/// Selection for a property retrieval or filter.
#[derive(Debug, Clone)]
pub enum ObjectSelection<'a> {
    Objects(&'a [ObjectRef]),
    /// Every object reachable through a container view.
    View(&'a ObjectRef),
}

pub struct SoapClient {
    client: Client,
    url: String,
    config: VsphereConfig,
    content: Option<ServiceContent>,
}

impl SoapClient {
    pub fn new(config: &VsphereConfig) -> VsphereResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .cookie_store(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VsphereError::connection(format!("Failed to build HTTP client: {e}")))?;

        let url = format!("{}/sdk", crate::vsphere::base_url(config)?);

        Ok(Self {
            client,
            url,
            config: config.clone(),
            content: None,
        })
    }

    pub fn content(&self) -> VsphereResult<&ServiceContent> {
        self.content
            .as_ref()
            .ok_or_else(|| VsphereError::connection("Not logged in: no active SOAP session"))
    }

    /// Default request timeout, used to size long-poll deadlines.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    // ── Session management ──────────────────────────────────────────

    pub async fn login(&mut self) -> VsphereResult<()> {
        let body = r#"<RetrieveServiceContent xmlns="urn:vim25"><_this type="ServiceInstance">ServiceInstance</_this></RetrieveServiceContent>"#
            .to_string();
        let resp = self.call(body, None).await?;
        let content = decode_service_content(&resp)?;

        let body = format!(
            r#"<Login xmlns="urn:vim25">{}{}{}</Login>"#,
            moref("_this", &content.session_manager),
            el("userName", &self.config.username),
            el("password", &self.config.password),
        );
        self.call(body, None).await?;

        log::debug!("SOAP session established with {}", self.config.host);
        self.content = Some(content);
        Ok(())
    }

    pub async fn logout(&self) {
        let Ok(content) = self.content() else { return };
        let body = format!(
            r#"<Logout xmlns="urn:vim25">{}</Logout>"#,
            moref("_this", &content.session_manager)
        );
        if let Err(e) = self.call(body, None).await {
            log::warn!("SOAP logout failed: {e}");
        }
    }

    // ── Generic invocation ──────────────────────────────────────────

    /// Invoke `method` on `this` with pre-serialised argument elements and
    /// return the response element.
    pub async fn invoke(
        &self,
        method: &str,
        this: &ObjectRef,
        args: &str,
        timeout: Option<Duration>,
    ) -> VsphereResult<XmlNode> {
        let body = format!(
            r#"<{method} xmlns="urn:vim25">{}{args}</{method}>"#,
            moref("_this", this)
        );
        self.call(body, timeout).await
    }

    /// Invoke a `*_Task` method and return the task handle.
    pub async fn invoke_task(&self, method: &str, this: &ObjectRef, args: &str) -> VsphereResult<TaskRef> {
        let resp = self.invoke(method, this, args, None).await?;
        let task = resp
            .child("returnval")
            .and_then(XmlNode::to_object_ref)
            .ok_or_else(|| VsphereError::parse(format!("{method} returned no task reference")))?;
        log::debug!("{method} on {} accepted as {}", this.value, task.value);
        Ok(TaskRef::new(task.value))
    }

    async fn call(&self, body: String, timeout: Option<Duration>) -> VsphereResult<XmlNode> {
        let mut req = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope(&body));
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| VsphereError::transient(format!("Failed to read SOAP response: {e}")))?;

        let doc = match parse_xml(&text) {
            Ok(doc) => doc,
            Err(e) if status.is_success() => return Err(e),
            Err(_) => {
                let code = status.as_u16();
                return Err(VsphereError::api(code, format!("SOAP HTTP error {code}: {}", truncate(&text))));
            }
        };

        let body = doc
            .find("Body")
            .ok_or_else(|| VsphereError::parse("SOAP response has no Body"))?;
        if let Some(fault) = body.child("Fault") {
            return Err(decode_fault(fault));
        }
        if !status.is_success() {
            let code = status.as_u16();
            return Err(VsphereError::api(code, format!("SOAP HTTP error {code}")));
        }
        Ok(body.children.first().cloned().unwrap_or_default())
    }

    // ── Property collector ──────────────────────────────────────────

    /// `RetrievePropertiesEx`, following continuation tokens.
    pub async fn retrieve(
        &self,
        selection: &ObjectSelection<'_>,
        kinds: &[&str],
        paths: &[&str],
    ) -> VsphereResult<Vec<ObjectProperties>> {
        let pc = self.content()?.property_collector.clone();
        let args = format!(
            "<specSet>{}</specSet><options/>",
            filter_spec_body(selection, kinds, paths)
        );
        let resp = self.invoke("RetrievePropertiesEx", &pc, &args, None).await?;

        let mut out = Vec::new();
        let mut token = collect_object_contents(&resp, &mut out);
        while let Some(t) = token {
            let resp = self
                .invoke("ContinueRetrievePropertiesEx", &pc, &el("token", &t), None)
                .await?;
            token = collect_object_contents(&resp, &mut out);
        }
        Ok(out)
    }

    /// Properties of every object of `kind`, through a short-lived container view.
    pub async fn retrieve_kind(&self, kind: &str, paths: &[&str]) -> VsphereResult<Vec<ObjectProperties>> {
        let view = self.create_container_view(kind).await?;
        let result = self.retrieve(&ObjectSelection::View(&view), &[kind], paths).await;
        if let Err(e) = self.destroy_view(&view).await {
            log::warn!("Failed to destroy container view {}: {e}", view.value);
        }
        result
    }

    pub async fn create_container_view(&self, kind: &str) -> VsphereResult<ObjectRef> {
        let content = self.content()?;
        let args = format!(
            "{}{}<recursive>true</recursive>",
            moref("container", &content.root_folder),
            el("type", kind)
        );
        let resp = self.invoke("CreateContainerView", &content.view_manager, &args, None).await?;
        returnval_ref(&resp, "CreateContainerView")
    }

    pub async fn destroy_view(&self, view: &ObjectRef) -> VsphereResult<()> {
        self.invoke("DestroyView", view, "", None).await.map(|_| ())
    }

    pub async fn create_property_collector(&self) -> VsphereResult<ObjectRef> {
        let pc = self.content()?.property_collector.clone();
        let resp = self.invoke("CreatePropertyCollector", &pc, "", None).await?;
        returnval_ref(&resp, "CreatePropertyCollector")
    }

    pub async fn destroy_property_collector(&self, collector: &ObjectRef) -> VsphereResult<()> {
        self.invoke("DestroyPropertyCollector", collector, "", None).await.map(|_| ())
    }

    pub async fn create_filter(
        &self,
        collector: &ObjectRef,
        selection: &ObjectSelection<'_>,
        kinds: &[&str],
        paths: &[&str],
    ) -> VsphereResult<ObjectRef> {
        let args = format!(
            "<spec>{}</spec><partialUpdates>false</partialUpdates>",
            filter_spec_body(selection, kinds, paths)
        );
        let resp = self.invoke("CreateFilter", collector, &args, None).await?;
        returnval_ref(&resp, "CreateFilter")
    }

    /// `WaitForUpdatesEx`. The HTTP deadline is stretched past the server-side
    /// wait so a legitimate long poll is never cut short.
    pub async fn wait_for_updates(
        &self,
        collector: &ObjectRef,
        version: &str,
        max_wait_secs: u64,
    ) -> VsphereResult<Option<UpdateBatch>> {
        let args = format!(
            "{}<options><maxWaitSeconds>{max_wait_secs}</maxWaitSeconds></options>",
            el("version", version)
        );
        let deadline = Duration::from_secs(max_wait_secs) + self.request_timeout();
        let resp = self
            .invoke("WaitForUpdatesEx", collector, &args, Some(deadline))
            .await?;
        Ok(decode_update_set(&resp))
    }
}

fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><soapenv:Body>{body}</soapenv:Body></soapenv:Envelope>"#
    )
}

fn truncate(text: &str) -> &str {
    let cut = text.char_indices().nth(300).map(|(i, _)| i).unwrap_or(text.len());
    &text[..cut]
}

fn returnval_ref(resp: &XmlNode, method: &str) -> VsphereResult<ObjectRef> {
    resp.child("returnval")
        .and_then(XmlNode::to_object_ref)
        .ok_or_else(|| VsphereError::parse(format!("{method} returned no object reference")))
}

/// `propSet` + `objectSet` content shared by `RetrievePropertiesEx` and
/// `CreateFilter`. One `propSet` per kind; no paths means all properties.
pub(crate) fn filter_spec_body(selection: &ObjectSelection<'_>, kinds: &[&str], paths: &[&str]) -> String {
    let mut out = String::new();
    for kind in kinds {
        out.push_str("<propSet>");
        out.push_str(&el("type", kind));
        if paths.is_empty() {
            out.push_str("<all>true</all>");
        } else {
            for p in paths {
                out.push_str(&el("pathSet", p));
            }
        }
        out.push_str("</propSet>");
    }
    match selection {
        ObjectSelection::Objects(objs) => {
            for o in *objs {
                out.push_str(&format!("<objectSet>{}<skip>false</skip></objectSet>", moref("obj", o)));
            }
        }
        ObjectSelection::View(view) => {
            out.push_str(&format!(
                concat!(
                    "<objectSet>{}<skip>true</skip>",
                    r#"<selectSet xsi:type="TraversalSpec"><name>traverseView</name>"#,
                    "<type>ContainerView</type><path>view</path><skip>false</skip></selectSet>",
                    "</objectSet>"
                ),
                moref("obj", view)
            ));
        }
    }
    out
}

// ── Response decoders ───────────────────────────────────────────────

fn decode_fault(fault: &XmlNode) -> VsphereError {
    let message = fault
        .text_of("faultstring")
        .filter(|s| !s.is_empty())
        .unwrap_or("Unknown SOAP fault")
        .to_string();
    let detail = fault
        .child("detail")
        .and_then(|d| d.children.first())
        .map(|d| d.xsi_type().unwrap_or(d.name.as_str()).trim_end_matches("Fault").to_string())
        .unwrap_or_default();

    let kind = match detail.as_str() {
        "NotAuthenticated" | "InvalidLogin" => VsphereErrorKind::AuthenticationError,
        "NoPermission" => VsphereErrorKind::AccessDenied,
        "ManagedObjectNotFound" => VsphereErrorKind::NotFound,
        "InvalidState" | "InvalidPowerState" | "TaskInProgress" => VsphereErrorKind::InvalidState,
        _ => VsphereErrorKind::SoapFault,
    };
    VsphereError::new(kind, message)
}

pub(crate) fn decode_service_content(resp: &XmlNode) -> VsphereResult<ServiceContent> {
    let rv = resp
        .child("returnval")
        .ok_or_else(|| VsphereError::parse("RetrieveServiceContent returned nothing"))?;
    let get = |name: &str| {
        rv.child(name)
            .and_then(XmlNode::to_object_ref)
            .ok_or_else(|| VsphereError::parse(format!("ServiceContent is missing {name}")))
    };
    Ok(ServiceContent {
        root_folder: get("rootFolder")?,
        property_collector: get("propertyCollector")?,
        view_manager: get("viewManager")?,
        session_manager: get("sessionManager")?,
        perf_manager: rv.child("perfManager").and_then(XmlNode::to_object_ref),
    })
}

/// Append every `ObjectContent` in a retrieve result; return the
/// continuation token, if any.
pub(crate) fn collect_object_contents(resp: &XmlNode, out: &mut Vec<ObjectProperties>) -> Option<String> {
    let rv = resp.child("returnval")?;
    for oc in rv.children_named("objects") {
        let Some(obj) = oc.child("obj").and_then(XmlNode::to_object_ref) else { continue };
        let mut props = serde_json::Map::new();
        for ps in oc.children_named("propSet") {
            if let (Some(name), Some(val)) = (ps.text_of("name"), ps.child("val")) {
                props.insert(name.to_string(), val.to_json());
            }
        }
        for missing in oc.children_named("missingSet") {
            log::debug!(
                "Property {} unavailable on {}",
                missing.text_of("path").unwrap_or("?"),
                obj.value
            );
        }
        out.push(ObjectProperties { obj, props });
    }
    rv.text_of("token").filter(|t| !t.is_empty()).map(str::to_string)
}

pub(crate) fn decode_update_set(resp: &XmlNode) -> Option<UpdateBatch> {
    let rv = resp.child("returnval")?;
    let version = rv.text_of("version").unwrap_or_default().to_string();
    let mut objects = Vec::new();
    for fs in rv.children_named("filterSet") {
        for os in fs.children_named("objectSet") {
            let Some(obj) = os.child("obj").and_then(XmlNode::to_object_ref) else { continue };
            let changes = os
                .children_named("changeSet")
                .map(|cs| PropertyChange {
                    name: cs.text_of("name").unwrap_or_default().to_string(),
                    op: cs.text_of("op").unwrap_or_default().to_string(),
                    value: cs.child("val").map(XmlNode::to_json),
                })
                .collect();
            objects.push(ObjectUpdate {
                obj,
                kind: os.text_of("kind").unwrap_or_default().to_string(),
                changes,
            });
        }
    }
    Some(UpdateBatch { version, objects })
}

/// Decode the `info` property of a Task (`TaskInfo`).
pub(crate) fn decode_task_info(info: &serde_json::Value) -> VsphereResult<TaskStatus> {
    let raw_state = info
        .get("state")
        .and_then(|v| v.as_str())
        .ok_or_else(|| VsphereError::parse("TaskInfo has no state"))?;
    let state = TaskState::from_vim(raw_state)
        .ok_or_else(|| VsphereError::parse(format!("Unknown task state '{raw_state}'")))?;
    let progress = info
        .get("progress")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .map(|p| p.clamp(0, 100) as u8);
    let error = (state == TaskState::Failed).then(|| {
        info.get("error")
            .and_then(|e| e.get("localizedMessage"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "Task failed without an error message".to_string())
    });
    let result = if state == TaskState::Succeeded {
        info.get("result").cloned()
    } else {
        None
    };
    Ok(TaskStatus { state, progress, error, result })
}

/// Decode a `VirtualMachineSnapshotTree` list (the `snapshot.rootSnapshotList`
/// property), preserving child order.
pub(crate) fn decode_snapshot_trees(list: Option<&serde_json::Value>) -> Vec<RemoteSnapshot> {
    as_list(list)
        .into_iter()
        .filter_map(|node| {
            let reference: ObjectRef = serde_json::from_value(node.get("snapshot")?.clone()).ok()?;
            let s = |k: &str| node.get(k).and_then(|v| v.as_str()).map(str::to_string);
            Some(RemoteSnapshot {
                reference,
                name: s("name").unwrap_or_default(),
                description: s("description").unwrap_or_default(),
                create_time: s("createTime"),
                state: s("state"),
                quiesced: node
                    .get("quiesced")
                    .is_some_and(|q| q.as_bool() == Some(true) || q.as_str() == Some("true")),
                children: decode_snapshot_trees(node.get("childSnapshotList")),
            })
        })
        .collect()
}

/// Decode the perf manager's `perfCounter` property.
pub(crate) fn decode_perf_counters(list: Option<&serde_json::Value>) -> Vec<PerfCounterInfo> {
    as_list(list)
        .into_iter()
        .filter_map(|c| {
            let key_str = |path: &[&str]| -> String {
                let mut cur = c;
                for p in path {
                    match cur.get(*p) {
                        Some(next) => cur = next,
                        None => return String::new(),
                    }
                }
                cur.as_str().map(str::to_string).unwrap_or_else(|| cur.to_string())
            };
            let key = c.get("key").and_then(|k| k.as_i64().or_else(|| k.as_str()?.parse().ok()))?;
            Some(PerfCounterInfo {
                key: key as i32,
                group: key_str(&["groupInfo", "key"]),
                name: key_str(&["nameInfo", "key"]),
                rollup_type: key_str(&["rollupType"]),
                stats_type: key_str(&["statsType"]),
                unit: key_str(&["unitInfo", "key"]),
                description: key_str(&["nameInfo", "summary"]),
            })
        })
        .collect()
}

/// Decode a `QueryPerf` response into one series per counter / instance.
pub(crate) fn decode_perf_series(resp: &XmlNode) -> Vec<PerfSeries> {
    let mut out = Vec::new();
    for entity in resp.children_named("returnval") {
        for value in entity.children_named("value") {
            let Some(id) = value.child("id") else { continue };
            let Some(counter_id) = id.text_of("counterId").and_then(|s| s.parse().ok()) else { continue };
            out.push(PerfSeries {
                counter_id,
                instance: id.text_of("instance").unwrap_or_default().to_string(),
                values: value
                    .children_named("value")
                    .filter_map(|v| v.text.parse().ok())
                    .collect(),
            });
        }
    }
    out
}

/// Group references by kind so each kind gets its own `propSet`.
pub(crate) fn kinds_of(objs: &[ObjectRef]) -> Vec<&str> {
    let mut seen = BTreeMap::new();
    for o in objs {
        seen.entry(o.kind.as_str()).or_insert(());
    }
    seen.into_keys().collect()
}
