//! Built-in search parameters.
//!
//! Resource-level parameters (`_id`, `_lastUpdated`, ...) apply to every type.
//! The clinical set covers the resource types bundles most often carry
//! conditional operations for; deployments extend it through the registry.

use crate::parameters::{SearchParameter, SearchParameterType};
use crate::registry::SearchParameterRegistry;

use SearchParameterType::{Date, Reference, String as Str, Token, Uri};

/// (code, type, base types, expression, reference targets)
type BuiltinParam = (
    &'static str,
    SearchParameterType,
    &'static [&'static str],
    &'static str,
    &'static [&'static str],
);

const COMMON: &[BuiltinParam] = &[
    ("_id", Token, &["Resource"], "Resource.id", &[]),
    (
        "_lastUpdated",
        Date,
        &["Resource"],
        "Resource.meta.lastUpdated",
        &[],
    ),
    ("_tag", Token, &["Resource"], "Resource.meta.tag", &[]),
    ("_profile", Uri, &["Resource"], "Resource.meta.profile", &[]),
    (
        "_security",
        Token,
        &["Resource"],
        "Resource.meta.security",
        &[],
    ),
    ("_source", Uri, &["Resource"], "Resource.meta.source", &[]),
];

const CLINICAL: &[BuiltinParam] = &[
    // Patient
    ("identifier", Token, &["Patient"], "Patient.identifier", &[]),
    ("name", Str, &["Patient"], "Patient.name", &[]),
    ("family", Str, &["Patient", "Practitioner"], "Patient.name.family | Practitioner.name.family", &[]),
    ("given", Str, &["Patient", "Practitioner"], "Patient.name.given | Practitioner.name.given", &[]),
    ("birthdate", Date, &["Patient"], "Patient.birthDate", &[]),
    ("gender", Token, &["Patient", "Practitioner"], "Patient.gender | Practitioner.gender", &[]),
    ("active", Token, &["Patient", "Practitioner", "Organization"], "Patient.active | Practitioner.active | Organization.active", &[]),
    ("organization", Reference, &["Patient"], "Patient.managingOrganization", &["Organization"]),
    ("general-practitioner", Reference, &["Patient"], "Patient.generalPractitioner", &["Practitioner", "Organization"]),
    ("link", Reference, &["Patient"], "Patient.link.other", &["Patient"]),
    // Practitioner
    ("identifier", Token, &["Practitioner"], "Practitioner.identifier", &[]),
    ("name", Str, &["Practitioner"], "Practitioner.name", &[]),
    // Organization
    ("identifier", Token, &["Organization"], "Organization.identifier", &[]),
    ("name", Str, &["Organization"], "Organization.name", &[]),
    ("partof", Reference, &["Organization"], "Organization.partOf", &["Organization"]),
    // Location
    ("identifier", Token, &["Location"], "Location.identifier", &[]),
    ("name", Str, &["Location"], "Location.name", &[]),
    ("organization", Reference, &["Location"], "Location.managingOrganization", &["Organization"]),
    // Encounter
    ("identifier", Token, &["Encounter"], "Encounter.identifier", &[]),
    ("status", Token, &["Encounter"], "Encounter.status", &[]),
    ("subject", Reference, &["Encounter"], "Encounter.subject", &["Patient"]),
    ("patient", Reference, &["Encounter"], "Encounter.subject", &["Patient"]),
    ("date", Date, &["Encounter"], "Encounter.period", &[]),
    // Observation
    ("identifier", Token, &["Observation"], "Observation.identifier", &[]),
    ("code", Token, &["Observation"], "Observation.code", &[]),
    ("status", Token, &["Observation"], "Observation.status", &[]),
    ("subject", Reference, &["Observation"], "Observation.subject", &["Patient", "Group", "Device", "Location"]),
    ("patient", Reference, &["Observation"], "Observation.subject", &["Patient"]),
    ("encounter", Reference, &["Observation"], "Observation.encounter", &["Encounter"]),
    ("performer", Reference, &["Observation"], "Observation.performer", &["Practitioner", "Organization", "Patient"]),
    ("date", Date, &["Observation"], "Observation.effective", &[]),
    // Condition
    ("identifier", Token, &["Condition"], "Condition.identifier", &[]),
    ("code", Token, &["Condition"], "Condition.code", &[]),
    ("subject", Reference, &["Condition"], "Condition.subject", &["Patient", "Group"]),
    ("patient", Reference, &["Condition"], "Condition.subject", &["Patient"]),
    // DiagnosticReport
    ("identifier", Token, &["DiagnosticReport"], "DiagnosticReport.identifier", &[]),
    ("code", Token, &["DiagnosticReport"], "DiagnosticReport.code", &[]),
    ("status", Token, &["DiagnosticReport"], "DiagnosticReport.status", &[]),
    ("subject", Reference, &["DiagnosticReport"], "DiagnosticReport.subject", &["Patient", "Group", "Device", "Location"]),
    ("patient", Reference, &["DiagnosticReport"], "DiagnosticReport.subject", &["Patient"]),
    ("result", Reference, &["DiagnosticReport"], "DiagnosticReport.result", &["Observation"]),
    // Specimen
    ("identifier", Token, &["Specimen"], "Specimen.identifier", &[]),
    ("subject", Reference, &["Specimen"], "Specimen.subject", &["Patient", "Group", "Device", "Substance"]),
    // ServiceRequest
    ("identifier", Token, &["ServiceRequest"], "ServiceRequest.identifier", &[]),
    ("subject", Reference, &["ServiceRequest"], "ServiceRequest.subject", &["Patient", "Group", "Device", "Location"]),
    // MedicationRequest
    ("identifier", Token, &["MedicationRequest"], "MedicationRequest.identifier", &[]),
    ("subject", Reference, &["MedicationRequest"], "MedicationRequest.subject", &["Patient", "Group"]),
    ("patient", Reference, &["MedicationRequest"], "MedicationRequest.subject", &["Patient"]),
    // Appointment
    ("identifier", Token, &["Appointment"], "Appointment.identifier", &[]),
    ("actor", Reference, &["Appointment"], "Appointment.participant.actor", &[]),
    ("date", Date, &["Appointment"], "Appointment.start", &[]),
];

fn register_all(registry: &SearchParameterRegistry, params: &[BuiltinParam]) {
    for (code, param_type, base, expression, targets) in params {
        // Each base gets its own definition so per-type expressions stay separate.
        for b in *base {
            let url = format!("http://hl7.org/fhir/SearchParameter/{b}-{code}");
            registry.register(
                SearchParameter::new(*code, url, *param_type, vec![(*b).to_string()])
                    .with_expression(*expression)
                    .with_targets(targets.iter().map(|t| (*t).to_string()).collect()),
            );
        }
    }
}

/// Register all common (Resource-level) search parameters.
pub fn register_common_parameters(registry: &SearchParameterRegistry) {
    register_all(registry, COMMON);
    tracing::debug!(count = COMMON.len(), "Registered common search parameters");
}

/// Register the built-in clinical search parameters.
pub fn register_clinical_parameters(registry: &SearchParameterRegistry) {
    register_all(registry, CLINICAL);
    tracing::debug!(count = CLINICAL.len(), "Registered clinical search parameters");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_common_parameters() {
        let registry = SearchParameterRegistry::new();
        register_common_parameters(&registry);

        assert!(registry.get("Patient", "_id").is_some());
        assert!(registry.get("Patient", "_lastUpdated").is_some());
        assert!(registry.get("Patient", "_tag").is_some());
        assert!(registry.get("Observation", "_id").is_some());
        assert!(registry.get("Condition", "_lastUpdated").is_some());
        assert!(registry.get("Patient", "identifier").is_none());
    }

    #[test]
    fn test_common_parameter_expressions() {
        let registry = SearchParameterRegistry::new();
        register_common_parameters(&registry);

        let id_param = registry.get("Patient", "_id").unwrap();
        assert_eq!(id_param.expression.as_deref(), Some("Resource.id"));
        assert_eq!(id_param.paths_for("Patient"), vec![vec!["id".to_string()]]);
    }

    #[test]
    fn test_clinical_parameters_are_per_type() {
        let registry = SearchParameterRegistry::new();
        register_clinical_parameters(&registry);

        let patient_family = registry.get("Patient", "family").unwrap();
        assert_eq!(patient_family.base, vec!["Patient".to_string()]);
        let practitioner_family = registry.get("Practitioner", "family").unwrap();
        assert_eq!(
            practitioner_family.paths_for("Practitioner"),
            vec![vec!["name".to_string(), "family".to_string()]]
        );
        assert!(registry.get("Patient", "foo").is_none());
    }
}
