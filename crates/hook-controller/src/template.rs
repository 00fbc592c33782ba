//! Safe expansion of user-authored prompt templates.
//!
//! Prompts travel from hook authors to an LLM-backed agent, so expansion
//! stays conservative: a fixed placeholder set is substituted
//! literally, engine constructs that could pull in definitions or reformat
//! arbitrary data are rejected up front, and a template that fails
//! validation is passed through byte-for-byte rather than half-expanded.

use chrono::SecondsFormat;
use handlebars::Handlebars;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::ClassifiedEvent;

/// Upper bound on prompt template length.
pub const MAX_TEMPLATE_LEN: usize = 10_000;

/// Engine constructs that are never allowed in a prompt.
pub const DENYLISTED_PREFIXES: [&str; 11] = [
    "{{/*",
    "{{define",
    "{{template",
    "{{call",
    "{{data",
    "{{urlquery",
    "{{print",
    "{{printf",
    "{{println",
    "{{js",
    "{{html",
];

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(
        r"\{\{\s*(EventType|ResourceName|Namespace|Reason|Message|Timestamp|EventTime|EventMessage)\s*\}\}"
    )
    .unwrap();
}

/// Reasons a template fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template is empty")]
    Empty,
    #[error("template is {0} characters, maximum is {MAX_TEMPLATE_LEN}")]
    TooLong(usize),
    #[error("unbalanced template braces ({open} openings, {close} closings)")]
    Unbalanced { open: usize, close: usize },
    #[error("template contains denylisted construct {0:?}")]
    Denylisted(&'static str),
}

/// Validate a template against the admission rules.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    if template.is_empty() {
        return Err(TemplateError::Empty);
    }
    if template.len() > MAX_TEMPLATE_LEN {
        return Err(TemplateError::TooLong(template.len()));
    }

    let open = template.matches("{{").count();
    let close = template.matches("}}").count();
    if open != close {
        return Err(TemplateError::Unbalanced { open, close });
    }

    for prefix in DENYLISTED_PREFIXES {
        if template.contains(prefix) {
            return Err(TemplateError::Denylisted(prefix));
        }
    }
    Ok(())
}

/// Expand a template against an event.
///
/// Invalid templates are returned unchanged so that the agent still receives
/// the author's text rather than nothing. Expansion substitutes the known
/// placeholder set literally; unknown placeholders are passed through
/// verbatim. Only a template with no `{{...}}` left afterwards is handed to
/// the template engine, which keeps engine syntax from ever seeing
/// unresolved user constructs.
pub fn expand(template: &str, event: &ClassifiedEvent) -> String {
    if let Err(err) = validate_template(template) {
        warn!(error = %err, "prompt template failed validation, using raw template");
        return template.to_string();
    }

    let expanded = substitute_known(template, event);
    if expanded.contains("{{") {
        return expanded;
    }

    let data = json!({
        "EventType": event.event_type.as_str(),
        "ResourceName": event.resource_name,
        "Namespace": event.namespace,
        "Reason": event.reason,
        "Message": event.message,
        "Timestamp": rfc3339(event),
        "EventTime": rfc3339(event),
        "EventMessage": event.message,
        "Event": {
            "eventType": event.event_type.as_str(),
            "resourceName": event.resource_name,
            "namespace": event.namespace,
            "timestamp": rfc3339(event),
            "reason": event.reason,
            "message": event.message,
            "uid": event.uid,
            "metadata": event.metadata,
        },
    });

    let mut engine = Handlebars::new();
    engine.set_strict_mode(false);
    match engine.render_template(&expanded, &data) {
        Ok(rendered) => rendered,
        Err(err) => {
            debug!(error = %err, "advanced template pass failed, keeping literal expansion");
            expanded
        }
    }
}

fn substitute_known(template: &str, event: &ClassifiedEvent) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "EventType" => event.event_type.as_str().to_string(),
            "ResourceName" => event.resource_name.clone(),
            "Namespace" => event.namespace.clone(),
            "Reason" => event.reason.clone(),
            "Message" | "EventMessage" => event.message.clone(),
            "Timestamp" | "EventTime" => rfc3339(event),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

fn rfc3339(event: &ClassifiedEvent) -> String {
    event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}
