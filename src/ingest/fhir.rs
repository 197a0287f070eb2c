//! FHIR resource extraction from uploaded JSON and XML files.
//!
//! Only the envelope is inspected (resource type and logical id); the raw
//! resource text is what gets encrypted and stored. Bundles are expanded
//! into their entry resources.

use roxmltree::{Document, Node};
use serde_json::Value;

use super::IngestError;

const FHIR_NS: &str = "http://hl7.org/fhir";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FhirFormat {
    Json,
    Xml,
}

impl FhirFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FhirFormat::Json => "json",
            FhirFormat::Xml => "xml",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResource {
    pub resource_type: String,
    pub fhir_id: Option<String>,
    pub format: FhirFormat,
    pub raw: String,
}

pub fn parse(bytes: &[u8], format: FhirFormat) -> Result<Vec<ParsedResource>, IngestError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| IngestError::InvalidFhir("file is not valid UTF-8".into()))?;
    match format {
        FhirFormat::Json => parse_json(text),
        FhirFormat::Xml => parse_xml(text),
    }
}

pub fn parse_json(text: &str) -> Result<Vec<ParsedResource>, IngestError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| IngestError::InvalidFhir(format!("invalid JSON: {e}")))?;

    let resource_type = json_resource_type(&value)?;
    if resource_type != "Bundle" {
        return Ok(vec![json_resource(&value, resource_type.to_string())]);
    }

    let mut resources = Vec::new();
    let entries = value.get("entry").and_then(Value::as_array);
    for entry in entries.into_iter().flatten() {
        let Some(resource) = entry.get("resource") else {
            continue;
        };
        let resource_type = json_resource_type(resource)?;
        resources.push(json_resource(resource, resource_type.to_string()));
    }

    // An empty bundle is still a resource worth keeping.
    if resources.is_empty() {
        resources.push(json_resource(&value, "Bundle".to_string()));
    }
    Ok(resources)
}

fn json_resource_type(value: &Value) -> Result<&str, IngestError> {
    let object = value
        .as_object()
        .ok_or_else(|| IngestError::InvalidFhir("expected a JSON object".into()))?;
    object
        .get("resourceType")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IngestError::InvalidFhir("missing resourceType".into()))
}

fn json_resource(value: &Value, resource_type: String) -> ParsedResource {
    ParsedResource {
        resource_type,
        fhir_id: value.get("id").and_then(Value::as_str).map(str::to_string),
        format: FhirFormat::Json,
        raw: value.to_string(),
    }
}

pub fn parse_xml(text: &str) -> Result<Vec<ParsedResource>, IngestError> {
    let doc = Document::parse(text)
        .map_err(|e| IngestError::InvalidFhir(format!("invalid XML: {e}")))?;
    let root = doc.root_element();

    if root.tag_name().namespace().is_some_and(|ns| ns != FHIR_NS) {
        tracing::debug!(
            namespace = root.tag_name().namespace().unwrap_or(""),
            "XML resource outside the FHIR namespace"
        );
    }

    if root.tag_name().name() != "Bundle" {
        return Ok(vec![xml_resource(text, root)]);
    }

    let mut resources: Vec<ParsedResource> = root
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "entry")
        .filter_map(|entry| {
            entry
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "resource")
        })
        .filter_map(|resource| resource.children().find(Node::is_element))
        .map(|node| xml_resource(text, node))
        .collect();

    if resources.is_empty() {
        resources.push(xml_resource(text, root));
    }
    Ok(resources)
}

fn xml_resource(source: &str, node: Node) -> ParsedResource {
    let fhir_id = node
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "id")
        .and_then(|n| n.attribute("value"))
        .map(str::to_string);

    ParsedResource {
        resource_type: node.tag_name().name().to_string(),
        fhir_id,
        format: FhirFormat::Xml,
        raw: source[node.range()].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_single_resource() {
        let parsed = parse_json(r#"{"resourceType":"Patient","id":"p1","active":true}"#).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].resource_type, "Patient");
        assert_eq!(parsed[0].fhir_id.as_deref(), Some("p1"));
        assert_eq!(parsed[0].format, FhirFormat::Json);
    }

    #[test]
    fn json_bundle_expands_entries() {
        let bundle = r#"{
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "p1"}},
                {"resource": {"resourceType": "Observation", "id": "o1", "status": "final"}},
                {"fullUrl": "urn:uuid:no-resource"}
            ]
        }"#;
        let parsed = parse_json(bundle).unwrap();
        let types: Vec<_> = parsed.iter().map(|r| r.resource_type.as_str()).collect();
        assert_eq!(types, vec!["Patient", "Observation"]);
        assert!(parsed[1].raw.contains("\"status\":\"final\""));
    }

    #[test]
    fn json_without_resource_type_is_rejected() {
        assert!(matches!(
            parse_json(r#"{"id":"x"}"#),
            Err(IngestError::InvalidFhir(_))
        ));
        assert!(parse_json("[1,2,3]").is_err());
        assert!(parse_json("{not json").is_err());
    }

    #[test]
    fn xml_resource_type_and_id() {
        let xml = r#"<Patient xmlns="http://hl7.org/fhir"><id value="p9"/><active value="true"/></Patient>"#;
        let parsed = parse_xml(xml).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].resource_type, "Patient");
        assert_eq!(parsed[0].fhir_id.as_deref(), Some("p9"));
        assert_eq!(parsed[0].format.as_str(), "xml");
    }

    #[test]
    fn xml_bundle_expands_entries() {
        let xml = r#"<Bundle xmlns="http://hl7.org/fhir">
            <type value="collection"/>
            <entry><resource><Patient><id value="p1"/></Patient></resource></entry>
            <entry><resource><Condition><id value="c1"/></Condition></resource></entry>
        </Bundle>"#;
        let parsed = parse_xml(xml).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].resource_type, "Condition");
        assert_eq!(parsed[1].fhir_id.as_deref(), Some("c1"));
        assert!(parsed[0].raw.starts_with("<Patient>"));
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(matches!(
            parse_xml("<Patient><id value='x'>"),
            Err(IngestError::InvalidFhir(_))
        ));
    }

    #[test]
    fn non_utf8_bytes_are_rejected() {
        assert!(parse(&[0xff, 0xfe, 0x00], FhirFormat::Json).is_err());
    }
}
