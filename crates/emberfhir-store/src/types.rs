use emberfhir_core::{FhirVersion, WireFormat};
use std::path::PathBuf;

/// Resource types every tenant hosts a store for.
pub const SUPPORTED_TYPES: &[&str] = &[
    "AllergyIntolerance",
    "Appointment",
    "Basic",
    "CarePlan",
    "CareTeam",
    "Communication",
    "CommunicationRequest",
    "Condition",
    "Coverage",
    "Device",
    "DiagnosticReport",
    "DocumentReference",
    "Encounter",
    "Goal",
    "Group",
    "Immunization",
    "List",
    "Location",
    "Medication",
    "MedicationRequest",
    "Observation",
    "Organization",
    "Patient",
    "Practitioner",
    "PractitionerRole",
    "Procedure",
    "Questionnaire",
    "QuestionnaireResponse",
    "RelatedPerson",
    "Schedule",
    "SearchParameter",
    "ServiceRequest",
    "Slot",
    "Specimen",
    "Subscription",
    "SubscriptionTopic",
    "Task",
    "ValueSet",
];

pub fn is_supported_type(type_name: &str) -> bool {
    SUPPORTED_TYPES.binary_search(&type_name).is_ok()
}

/// A named, isolated engine instance.
#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub name: String,
    pub base_url: String,
    pub version: FhirVersion,
    pub load_directory: Option<PathBuf>,
    /// Maximum resources kept by the tenant; 0 means unbounded.
    pub max_resources: usize,
    pub smart_required: bool,
    pub formats: Vec<WireFormat>,
    pub protect_loaded: bool,
}

impl TenantSettings {
    pub fn new(name: impl Into<String>, version: FhirVersion, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            version,
            load_directory: None,
            max_resources: 0,
            smart_required: false,
            formats: vec![WireFormat::Json, WireFormat::Xml],
            protect_loaded: false,
        }
    }

    pub fn with_load_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.load_directory = Some(dir.into());
        self
    }

    pub fn with_max_resources(mut self, max: usize) -> Self {
        self.max_resources = max;
        self
    }

    pub fn with_protect_loaded(mut self, protect: bool) -> Self {
        self.protect_loaded = protect;
        self
    }

    pub fn with_smart_required(mut self, required: bool) -> Self {
        self.smart_required = required;
        self
    }
}
