//! Process descriptions
//!
//! A [`ProcessDescription`] is the validated, typed view of a script's
//! annotations: what the outer protocol layer advertises and what the run
//! loop binds and collects. Validation never stops at the first problem;
//! every message is collected so a script author sees all of them at once.

use serde::Serialize;
use std::collections::HashSet;
use std::str::FromStr;

use crate::annotation::{Annotation, AnnotationType, Attribute};
use crate::types::{DataType, Value};

/// One declared input
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputDescription {
    pub identifier: String,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    pub min_occurs: u32,
    pub max_occurs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl InputDescription {
    pub fn is_required(&self) -> bool {
        self.min_occurs > 0 && self.default.is_none()
    }
}

/// One declared output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDescription {
    pub identifier: String,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataLink {
    pub title: Option<String>,
    pub href: String,
}

/// Validated description of one algorithm
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessDescription {
    /// Public algorithm identifier
    pub identifier: String,
    /// Name the script gives itself in `wps.des`
    pub script_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub inputs: Vec<InputDescription>,
    pub outputs: Vec<OutputDescription>,
    pub resources: Vec<String>,
    pub imports: Vec<String>,
    pub metadata: Vec<MetadataLink>,
}

impl ProcessDescription {
    /// Build and validate a description from parsed annotations.
    ///
    /// Returns every validation message on failure.
    pub fn build(identifier: &str, annotations: &[Annotation]) -> Result<Self, Vec<String>> {
        let mut messages = Vec::new();

        let descriptions: Vec<&Annotation> = annotations
            .iter()
            .filter(|a| a.kind == AnnotationType::Description)
            .collect();
        match descriptions.len() {
            0 => messages.push("missing wps.des annotation".to_string()),
            1 => {}
            _ => {
                let lines: Vec<String> = descriptions.iter().map(|a| a.line.to_string()).collect();
                messages.push(format!(
                    "more than one wps.des annotation (lines {})",
                    lines.join(", ")
                ));
            }
        }
        let des = descriptions.first();
        let script_name = des
            .and_then(|a| a.text(Attribute::Id))
            .unwrap_or(identifier)
            .to_string();

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut resources = Vec::new();
        let mut imports = Vec::new();
        let mut metadata = Vec::new();
        let mut input_ids = HashSet::new();
        let mut output_ids = HashSet::new();

        for annotation in annotations {
            match annotation.kind {
                AnnotationType::Description => {}
                AnnotationType::Input => {
                    if let Some(input) = build_input(annotation, &mut messages) {
                        if !input_ids.insert(input.identifier.clone()) {
                            messages.push(format!(
                                "duplicate input identifier '{}'",
                                input.identifier
                            ));
                        } else {
                            inputs.push(input);
                        }
                    }
                }
                AnnotationType::Output => {
                    if let Some(output) = build_output(annotation, &mut messages) {
                        if !output_ids.insert(output.identifier.clone()) {
                            messages.push(format!(
                                "duplicate output identifier '{}'",
                                output.identifier
                            ));
                        } else {
                            outputs.push(output);
                        }
                    }
                }
                AnnotationType::Resource => resources.extend(annotation.list().iter().cloned()),
                AnnotationType::Import => imports.extend(annotation.list().iter().cloned()),
                AnnotationType::Metadata => match annotation.text(Attribute::Href) {
                    Some(href) => metadata.push(MetadataLink {
                        title: annotation.text(Attribute::Title).map(str::to_string),
                        href: href.to_string(),
                    }),
                    None => messages.push(format!(
                        "wps.metadata on line {} has no href",
                        annotation.line
                    )),
                },
            }
        }

        if !annotations.iter().any(|a| a.kind == AnnotationType::Output) {
            messages.push("no wps.out annotation: a process needs at least one output".to_string());
        }

        if !messages.is_empty() {
            return Err(messages);
        }

        Ok(Self {
            identifier: identifier.to_string(),
            script_name,
            title: des.and_then(|a| a.text(Attribute::Title)).map(str::to_string),
            abstract_text: des.and_then(|a| a.text(Attribute::Abstract)).map(str::to_string),
            version: des.and_then(|a| a.text(Attribute::Version)).map(str::to_string),
            author: des.and_then(|a| a.text(Attribute::Author)).map(str::to_string),
            inputs,
            outputs,
            resources,
            imports,
            metadata,
        })
    }

    pub fn input(&self, identifier: &str) -> Option<&InputDescription> {
        self.inputs.iter().find(|i| i.identifier == identifier)
    }

    pub fn output(&self, identifier: &str) -> Option<&OutputDescription> {
        self.outputs.iter().find(|o| o.identifier == identifier)
    }
}

/// Identifier and type shared by inputs and outputs
fn identity(
    annotation: &Annotation,
    what: &str,
    messages: &mut Vec<String>,
) -> Option<(String, DataType)> {
    let Some(id) = annotation.text(Attribute::Id) else {
        messages.push(format!(
            "{} on line {} has no identifier",
            annotation.kind, annotation.line
        ));
        return None;
    };
    let Some(raw_type) = annotation.text(Attribute::Type) else {
        messages.push(format!("{} '{}' has no type", what, id));
        return None;
    };
    match DataType::from_str(raw_type) {
        Ok(data_type) => Some((id.to_string(), data_type)),
        Err(_) => {
            messages.push(format!("{} '{}': unknown data type '{}'", what, id, raw_type));
            None
        }
    }
}

fn build_input(annotation: &Annotation, messages: &mut Vec<String>) -> Option<InputDescription> {
    let (identifier, data_type) = identity(annotation, "input", messages)?;
    let before = messages.len();

    let default = match annotation.text(Attribute::Value) {
        Some(raw) => match Value::parse_literal(raw).coerce(data_type) {
            Some(value) => Some(value),
            None => {
                messages.push(format!(
                    "input '{}': default value '{}' is not a valid {}",
                    identifier, raw, data_type
                ));
                None
            }
        },
        None => None,
    };

    // An input with a default may be omitted
    let min_occurs = annotation
        .integer(Attribute::MinOccurs)
        .unwrap_or(if default.is_some() { 0 } else { 1 });
    let max_occurs = annotation.integer(Attribute::MaxOccurs).unwrap_or(1);
    if max_occurs == 0 {
        messages.push(format!("input '{}': maxOccurs must be at least 1", identifier));
    } else if min_occurs > max_occurs {
        messages.push(format!(
            "input '{}': minOccurs ({}) exceeds maxOccurs ({})",
            identifier, min_occurs, max_occurs
        ));
    }

    (messages.len() == before).then(|| InputDescription {
        identifier,
        data_type,
        title: annotation.text(Attribute::Title).map(str::to_string),
        abstract_text: annotation.text(Attribute::Abstract).map(str::to_string),
        min_occurs,
        max_occurs,
        default,
    })
}

fn build_output(annotation: &Annotation, messages: &mut Vec<String>) -> Option<OutputDescription> {
    let (identifier, data_type) = identity(annotation, "output", messages)?;
    Some(OutputDescription {
        identifier,
        data_type,
        title: annotation.text(Attribute::Title).map(str::to_string),
        abstract_text: annotation.text(Attribute::Abstract).map(str::to_string),
    })
}
