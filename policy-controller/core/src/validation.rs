use crate::{Object, ObjectKey, PolicyRule, Record, Role, RoleBinding, Subject, WILDCARD};
use regex::Regex;
use thiserror::Error;

const DNS_LABEL_REGEX: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";
const DNS_LABEL_MAX_LEN: usize = 63;
const NAME_MAX_LEN: usize = 253;

/// A record was rejected before reaching the store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid {key}: {}", display_errors(.errors))]
pub struct ValidationError {
    pub key: ObjectKey,
    pub errors: Vec<FieldError>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

fn display_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn validate(object: &Object) -> Result<(), ValidationError> {
    match object {
        Object::Role(role) => validate_role(role),
        Object::RoleBinding(binding) => validate_role_binding(binding),
    }
}

pub fn validate_role(role: &Role) -> Result<(), ValidationError> {
    let mut errors = Errors::default();
    validate_metadata(role, &mut errors);
    for (i, rule) in role.rules.iter().enumerate() {
        validate_rule(&format!("rules[{i}]"), rule, &mut errors);
    }
    errors.finish(role.key())
}

pub fn validate_role_binding(binding: &RoleBinding) -> Result<(), ValidationError> {
    let mut errors = Errors::default();
    validate_metadata(binding, &mut errors);

    if let Err(reason) = validate_name(&binding.role_ref.name) {
        errors.push("roleRef.name", reason);
    }
    match (binding.namespace(), binding.role_ref.namespace.as_deref()) {
        (_, None) => {}
        (Some(ns), Some(role_ns)) if ns == role_ns => {}
        (Some(_), Some(_)) => errors.push(
            "roleRef.namespace",
            "must reference a cluster role or a role in the binding's namespace",
        ),
        (None, Some(_)) => errors.push(
            "roleRef.namespace",
            "cluster bindings may only reference cluster roles",
        ),
    }

    for (i, subject) in binding.subjects.iter().enumerate() {
        let field = format!("subjects[{i}]");
        if let Err(reason) = validate_name(subject.name()) {
            errors.push(format!("{field}.name"), reason);
        }
        if let Subject::ServiceAccount { namespace, .. } = subject {
            if let Err(reason) = validate_namespace(namespace) {
                errors.push(format!("{field}.namespace"), reason);
            }
        }
    }

    errors.finish(binding.key())
}

fn validate_metadata<R: Record>(record: &R, errors: &mut Errors) {
    if let Err(reason) = validate_name(record.name()) {
        errors.push("metadata.name", reason);
    }
    if let Some(ns) = record.namespace() {
        if let Err(reason) = validate_namespace(ns) {
            errors.push("metadata.namespace", reason);
        }
    }
}

fn validate_rule(field: &str, rule: &PolicyRule, errors: &mut Errors) {
    if rule.verbs.is_empty() {
        errors.push(format!("{field}.verbs"), "at least one verb is required");
    }

    match (rule.resources.is_empty(), rule.non_resource_urls.is_empty()) {
        (true, true) => errors.push(
            field,
            "at least one resource or non-resource URL is required",
        ),
        (false, false) => errors.push(
            field,
            "rules may not mix resources and non-resource URLs",
        ),
        (true, false) => {
            if !rule.resource_names.is_empty() {
                errors.push(
                    format!("{field}.resourceNames"),
                    "resource names do not apply to non-resource URLs",
                );
            }
            for url in &rule.non_resource_urls {
                if let Err(reason) = validate_non_resource_url(url) {
                    errors.push(format!("{field}.nonResourceURLs"), format!("{url:?} {reason}"));
                }
            }
        }
        (false, true) => {}
    }
}

fn validate_non_resource_url(url: &str) -> Result<(), &'static str> {
    if url == WILDCARD {
        return Ok(());
    }
    if !url.starts_with('/') {
        return Err("must begin with '/'");
    }
    if let Some(i) = url.find('*') {
        if i != url.len() - 1 {
            return Err("may only contain '*' as its final character");
        }
    }
    Ok(())
}

/// Names are used as path segments in store keys.
fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("must not be empty");
    }
    if name.len() > NAME_MAX_LEN {
        return Err("must be no more than 253 characters");
    }
    if name == "." || name == ".." {
        return Err("may not be '.' or '..'");
    }
    if name.contains('/') || name.contains('%') {
        return Err("may not contain '/' or '%'");
    }
    Ok(())
}

fn validate_namespace(ns: &str) -> Result<(), &'static str> {
    if ns.len() > DNS_LABEL_MAX_LEN {
        return Err("must be no more than 63 characters");
    }
    let regex = Regex::new(DNS_LABEL_REGEX).expect("should compile");
    if !regex.is_match(ns) {
        return Err("must be a DNS-1123 label");
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Errors(Vec<FieldError>);

impl Errors {
    fn push(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            reason: reason.into(),
        });
    }

    fn finish(self, key: ObjectKey) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Ok(());
        }
        Err(ValidationError {
            key,
            errors: self.0,
        })
    }
}
