//! Client field registry.
//!
//! Every field a client payload may carry is a [`ClientField`] variant, and
//! each variant belongs to exactly one [`FieldClass`]. Operational and PHI
//! membership is therefore a property of the enum rather than of two lists
//! that have to be kept disjoint by hand.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhiPartition {
    Clinical,
    Demographic,
    PregnancyIdentity,
}

impl PhiPartition {
    pub const ALL: [PhiPartition; 3] = [
        PhiPartition::Clinical,
        PhiPartition::Demographic,
        PhiPartition::PregnancyIdentity,
    ];

    pub fn table(self) -> &'static str {
        match self {
            PhiPartition::Clinical => "phi_clinical",
            PhiPartition::Demographic => "phi_demographics",
            PhiPartition::PregnancyIdentity => "phi_pregnancy_identity",
        }
    }

    pub fn fields(self) -> impl Iterator<Item = ClientField> {
        ClientField::ALL
            .iter()
            .copied()
            .filter(move |field| field.class() == FieldClass::Phi(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Operational,
    Phi(PhiPartition),
}

/// Storage kind of a column; patch values must match it or be `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// `YYYY-MM-DD`
    Date,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientField {
    Status,
    ServiceNeeded,
    PortalStatus,
    InvitedAt,
    InvitedBy,
    LastInviteSentAt,
    InviteSentCount,
    RequestedAt,
    CreatedAt,
    UpdatedAt,

    HealthHistory,
    Allergies,
    HealthNotes,

    RaceEthnicity,
    ClientAgeRange,
    AnnualIncome,
    Insurance,

    DueDate,
    BabySex,
    BabyName,
    NumberOfBabies,
    PregnancyNumber,
    HadPreviousPregnancies,
    PreviousPregnanciesCount,
    LivingChildrenCount,
    FirstName,
    LastName,
    Email,
    PhoneNumber,
    Address,
    DateOfBirth,
}

impl ClientField {
    pub const ALL: [ClientField; 31] = [
        ClientField::Status,
        ClientField::ServiceNeeded,
        ClientField::PortalStatus,
        ClientField::InvitedAt,
        ClientField::InvitedBy,
        ClientField::LastInviteSentAt,
        ClientField::InviteSentCount,
        ClientField::RequestedAt,
        ClientField::CreatedAt,
        ClientField::UpdatedAt,
        ClientField::HealthHistory,
        ClientField::Allergies,
        ClientField::HealthNotes,
        ClientField::RaceEthnicity,
        ClientField::ClientAgeRange,
        ClientField::AnnualIncome,
        ClientField::Insurance,
        ClientField::DueDate,
        ClientField::BabySex,
        ClientField::BabyName,
        ClientField::NumberOfBabies,
        ClientField::PregnancyNumber,
        ClientField::HadPreviousPregnancies,
        ClientField::PreviousPregnanciesCount,
        ClientField::LivingChildrenCount,
        ClientField::FirstName,
        ClientField::LastName,
        ClientField::Email,
        ClientField::PhoneNumber,
        ClientField::Address,
        ClientField::DateOfBirth,
    ];

    /// Fields mirrored into the operational identity cache.
    pub const IDENTITY: [ClientField; 4] = [
        ClientField::FirstName,
        ClientField::LastName,
        ClientField::Email,
        ClientField::PhoneNumber,
    ];

    /// Canonical snake_case name; also the column name in either store.
    pub fn name(self) -> &'static str {
        match self {
            ClientField::Status => "status",
            ClientField::ServiceNeeded => "service_needed",
            ClientField::PortalStatus => "portal_status",
            ClientField::InvitedAt => "invited_at",
            ClientField::InvitedBy => "invited_by",
            ClientField::LastInviteSentAt => "last_invite_sent_at",
            ClientField::InviteSentCount => "invite_sent_count",
            ClientField::RequestedAt => "requested_at",
            ClientField::CreatedAt => "created_at",
            ClientField::UpdatedAt => "updated_at",
            ClientField::HealthHistory => "health_history",
            ClientField::Allergies => "allergies",
            ClientField::HealthNotes => "health_notes",
            ClientField::RaceEthnicity => "race_ethnicity",
            ClientField::ClientAgeRange => "client_age_range",
            ClientField::AnnualIncome => "annual_income",
            ClientField::Insurance => "insurance",
            ClientField::DueDate => "due_date",
            ClientField::BabySex => "baby_sex",
            ClientField::BabyName => "baby_name",
            ClientField::NumberOfBabies => "number_of_babies",
            ClientField::PregnancyNumber => "pregnancy_number",
            ClientField::HadPreviousPregnancies => "had_previous_pregnancies",
            ClientField::PreviousPregnanciesCount => "previous_pregnancies_count",
            ClientField::LivingChildrenCount => "living_children_count",
            ClientField::FirstName => "first_name",
            ClientField::LastName => "last_name",
            ClientField::Email => "email",
            ClientField::PhoneNumber => "phone_number",
            ClientField::Address => "address",
            ClientField::DateOfBirth => "date_of_birth",
        }
    }

    pub fn class(self) -> FieldClass {
        use PhiPartition::*;

        match self {
            ClientField::Status
            | ClientField::ServiceNeeded
            | ClientField::PortalStatus
            | ClientField::InvitedAt
            | ClientField::InvitedBy
            | ClientField::LastInviteSentAt
            | ClientField::InviteSentCount
            | ClientField::RequestedAt
            | ClientField::CreatedAt
            | ClientField::UpdatedAt => FieldClass::Operational,

            ClientField::HealthHistory | ClientField::Allergies | ClientField::HealthNotes => {
                FieldClass::Phi(Clinical)
            }

            ClientField::RaceEthnicity
            | ClientField::ClientAgeRange
            | ClientField::AnnualIncome
            | ClientField::Insurance => FieldClass::Phi(Demographic),

            ClientField::DueDate
            | ClientField::BabySex
            | ClientField::BabyName
            | ClientField::NumberOfBabies
            | ClientField::PregnancyNumber
            | ClientField::HadPreviousPregnancies
            | ClientField::PreviousPregnanciesCount
            | ClientField::LivingChildrenCount
            | ClientField::FirstName
            | ClientField::LastName
            | ClientField::Email
            | ClientField::PhoneNumber
            | ClientField::Address
            | ClientField::DateOfBirth => FieldClass::Phi(PregnancyIdentity),
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            ClientField::InviteSentCount
            | ClientField::NumberOfBabies
            | ClientField::PregnancyNumber
            | ClientField::PreviousPregnanciesCount
            | ClientField::LivingChildrenCount => FieldKind::Integer,
            ClientField::HadPreviousPregnancies => FieldKind::Boolean,
            ClientField::DueDate | ClientField::DateOfBirth => FieldKind::Date,
            _ => FieldKind::Text,
        }
    }

    pub fn is_phi(self) -> bool {
        matches!(self.class(), FieldClass::Phi(_))
    }

    pub fn is_identity(self) -> bool {
        Self::IDENTITY.contains(&self)
    }

    /// Exact canonical-name match.
    pub fn from_name(name: &str) -> Option<ClientField> {
        Self::ALL.iter().copied().find(|field| field.name() == name)
    }

    /// Accepts the canonical snake_case name or its camelCase spelling.
    pub fn lookup(key: &str) -> Option<ClientField> {
        let key = key.trim();
        if let Some(field) = Self::from_name(key) {
            return Some(field);
        }
        if key.bytes().any(|b| b.is_ascii_uppercase()) {
            return Self::from_name(&camel_to_snake(key));
        }
        None
    }

    pub fn accepts(self, value: &Value) -> bool {
        match (self.kind(), value) {
            (_, Value::Null) => true,
            (FieldKind::Text, Value::String(_)) => true,
            (FieldKind::Date, Value::String(s)) => is_iso_date(s),
            (FieldKind::Integer, Value::Number(n)) => n
                .as_i64()
                .is_some_and(|v| i32::try_from(v).is_ok()),
            (FieldKind::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (idx, ch) in key.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `YYYY-MM-DD` naming a real calendar day the store's `date` type accepts.
fn is_iso_date(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(idx, b)| match idx {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return false;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok_and(|date| date.year() >= 1)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientPatchSplit {
    pub operational: Map<String, Value>,
    pub phi: Map<String, Value>,
}

/// Partition a flat patch by field class. Keys that are not canonical field
/// names are dropped from both halves.
pub fn split_client_patch(input: &Map<String, Value>) -> ClientPatchSplit {
    let mut split = ClientPatchSplit::default();
    for (key, value) in input {
        let Some(field) = ClientField::from_name(key) else {
            continue;
        };
        match field.class() {
            FieldClass::Operational => {
                split.operational.insert(key.clone(), value.clone());
            }
            FieldClass::Phi(_) => {
                split.phi.insert(key.clone(), value.clone());
            }
        }
    }
    split
}

pub fn strip_phi_from_operational(mut row: Map<String, Value>) -> Map<String, Value> {
    row.retain(|key, _| !ClientField::lookup(key).is_some_and(ClientField::is_phi));
    row
}

/// Flatten camelCase, snake_case and `{ "user": { .. } }` request bodies into
/// canonical field names. Unrecognized keys are carried through unchanged so
/// the caller's allow-list decides their fate.
pub fn normalize_phi_input(body: &Value) -> Result<Map<String, Value>, PatchError> {
    let Some(obj) = body.as_object() else {
        return Err(PatchError::NotAnObject);
    };

    let mut entries = Vec::with_capacity(obj.len());
    let mut nested = Vec::new();
    for (key, value) in obj {
        match (key.as_str(), value) {
            ("user", Value::Object(user)) => nested.extend(user.iter()),
            _ => entries.push((key, value)),
        }
    }
    entries.extend(nested);

    let mut out = Map::with_capacity(entries.len());
    for (key, value) in entries {
        let canonical = ClientField::lookup(key)
            .map(|field| field.name().to_string())
            .unwrap_or_else(|| key.clone());
        out.insert(canonical, value.clone());
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("Request body must be a JSON object")]
    NotAnObject,
    #[error("No fields to update")]
    Empty,
    #[error("Non-PHI fields not allowed")]
    MixedConcern { fields: Vec<&'static str> },
    #[error("Invalid value for field {field}")]
    InvalidValue { field: &'static str },
}

/// A PHI-only patch whose values match their column kinds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhiPatch {
    fields: BTreeMap<ClientField, Value>,
}

impl PhiPatch {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, PatchError> {
        let split = split_client_patch(map);

        if !split.operational.is_empty() {
            let fields = split
                .operational
                .keys()
                .filter_map(|key| ClientField::from_name(key))
                .map(ClientField::name)
                .collect();
            return Err(PatchError::MixedConcern { fields });
        }

        let mut fields = BTreeMap::new();
        for (key, value) in &split.phi {
            let Some(field) = ClientField::from_name(key) else {
                continue;
            };
            if !field.accepts(value) {
                return Err(PatchError::InvalidValue {
                    field: field.name(),
                });
            }
            fields.insert(field, value.clone());
        }

        if fields.is_empty() {
            return Err(PatchError::Empty);
        }

        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: ClientField) -> Option<&Value> {
        self.fields.get(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientField, &Value)> {
        self.fields.iter().map(|(field, value)| (*field, value))
    }

    pub fn partition(&self, partition: PhiPartition) -> Vec<(ClientField, &Value)> {
        self.iter()
            .filter(|(field, _)| field.class() == FieldClass::Phi(partition))
            .collect()
    }

    pub fn touches_identity(&self) -> bool {
        self.fields.keys().any(|field| field.is_identity())
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.keys().map(|field| field.name()).collect()
    }

    pub fn to_wire(&self) -> Map<String, Value> {
        self.iter()
            .map(|(field, value)| (field.name().to_string(), value.clone()))
            .collect()
    }
}

/// Identity-cache write derived from a PHI patch.
///
/// The outer `Option` of each slot is "was this field in the patch"; `None`
/// leaves the cached column untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityCacheUpdate {
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub email: Option<Option<String>>,
    pub phone_number: Option<Option<String>>,
}

impl IdentityCacheUpdate {
    /// `None` when the patch carries no identity field.
    pub fn from_patch(patch: &PhiPatch) -> Option<Self> {
        if !patch.touches_identity() {
            return None;
        }

        let mut update = Self::default();
        for (field, value) in patch.iter() {
            let slot = match field {
                ClientField::FirstName => &mut update.first_name,
                ClientField::LastName => &mut update.last_name,
                ClientField::Email => &mut update.email,
                ClientField::PhoneNumber => &mut update.phone_number,
                _ => continue,
            };
            *slot = Some(value.as_str().map(str::to_string));
        }
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test input must be an object")
    }

    #[test]
    fn every_partition_owns_fields_and_tables_are_distinct() {
        for partition in PhiPartition::ALL {
            assert!(partition.fields().count() > 0, "{:?} has no fields", partition);
        }
        let mut tables = PhiPartition::ALL.map(PhiPartition::table).to_vec();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), 3);
    }

    #[test]
    fn identity_fields_are_phi() {
        for field in ClientField::IDENTITY {
            assert_eq!(field.class(), FieldClass::Phi(PhiPartition::PregnancyIdentity));
        }
    }

    #[test]
    fn lookup_accepts_camel_case() {
        assert_eq!(ClientField::lookup("firstName"), Some(ClientField::FirstName));
        assert_eq!(ClientField::lookup("dateOfBirth"), Some(ClientField::DateOfBirth));
        assert_eq!(ClientField::lookup("health_history"), Some(ClientField::HealthHistory));
        assert_eq!(ClientField::lookup("HealthHistory"), Some(ClientField::HealthHistory));
        assert_eq!(ClientField::lookup("favoriteColor"), None);
        assert_eq!(ClientField::from_name("firstName"), None);
    }

    #[test]
    fn split_partitions_and_drops_unknown_keys() {
        let split = split_client_patch(&obj(serde_json::json!({
            "status": "active",
            "health_history": "asthma",
            "first_name": "Jane",
            "ssn_backup": "123",
        })));

        assert_eq!(split.operational, obj(serde_json::json!({"status": "active"})));
        assert_eq!(
            split.phi,
            obj(serde_json::json!({"health_history": "asthma", "first_name": "Jane"}))
        );
    }

    #[test]
    fn strip_removes_phi_and_keeps_the_rest() {
        let row = obj(serde_json::json!({
            "id": "c1",
            "status": "lead",
            "first_name": "Jane",
            "email": "jane@example.com",
            "dueDate": "2026-01-01",
        }));
        let stripped = strip_phi_from_operational(row);
        assert_eq!(stripped, obj(serde_json::json!({"id": "c1", "status": "lead"})));
    }

    #[test]
    fn normalize_flattens_all_three_shapes() {
        let expected = obj(serde_json::json!({"first_name": "Jane", "due_date": "2026-03-01"}));

        let camel = normalize_phi_input(&serde_json::json!({
            "firstName": "Jane",
            "dueDate": "2026-03-01",
        }))
        .expect("camel input should normalize");
        let snake = normalize_phi_input(&serde_json::json!({
            "first_name": "Jane",
            "due_date": "2026-03-01",
        }))
        .expect("snake input should normalize");
        let nested = normalize_phi_input(&serde_json::json!({
            "user": { "firstName": "Jane", "due_date": "2026-03-01" }
        }))
        .expect("nested input should normalize");

        assert_eq!(camel, expected);
        assert_eq!(snake, expected);
        assert_eq!(nested, expected);
    }

    #[test]
    fn normalize_rejects_non_objects() {
        assert_eq!(
            normalize_phi_input(&serde_json::json!(["first_name"])),
            Err(PatchError::NotAnObject)
        );
    }

    #[test]
    fn phi_patch_rejects_operational_keys() {
        let err = PhiPatch::from_map(&obj(serde_json::json!({
            "status": "active",
            "health_history": "x",
        })))
        .unwrap_err();
        assert_eq!(err, PatchError::MixedConcern { fields: vec!["status"] });
        assert_eq!(err.to_string(), "Non-PHI fields not allowed");
    }

    #[test]
    fn phi_patch_requires_at_least_one_known_field() {
        assert_eq!(
            PhiPatch::from_map(&Map::new()).unwrap_err(),
            PatchError::Empty
        );
        assert_eq!(
            PhiPatch::from_map(&obj(serde_json::json!({"nickname": "JJ"}))).unwrap_err(),
            PatchError::Empty
        );
    }

    #[test]
    fn phi_patch_checks_value_kinds_without_echoing_values() {
        let err = PhiPatch::from_map(&obj(serde_json::json!({
            "due_date": "next spring",
        })))
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for field due_date");

        for impossible in ["2026-02-31", "0000-01-01", "2025-02-29", "2026-04-31", "2026-1-05"] {
            let err = PhiPatch::from_map(&obj(serde_json::json!({"due_date": impossible})))
                .unwrap_err();
            assert_eq!(err, PatchError::InvalidValue { field: "due_date" }, "{}", impossible);
        }
        PhiPatch::from_map(&obj(serde_json::json!({"due_date": "2028-02-29"})))
            .expect("leap day should be accepted");

        let err = PhiPatch::from_map(&obj(serde_json::json!({"number_of_babies": "two"})))
            .unwrap_err();
        assert_eq!(err, PatchError::InvalidValue { field: "number_of_babies" });

        let ok = PhiPatch::from_map(&obj(serde_json::json!({
            "number_of_babies": 2,
            "had_previous_pregnancies": false,
            "allergies": null,
            "date_of_birth": "1990-07-14",
        })))
        .expect("well-typed patch should build");
        assert_eq!(ok.len(), 4);
    }

    #[test]
    fn identity_update_only_sets_present_fields() {
        let patch = PhiPatch::from_map(&obj(serde_json::json!({"first_name": "Jane"})))
            .expect("patch should build");
        let update = IdentityCacheUpdate::from_patch(&patch).expect("identity touched");
        assert_eq!(
            update,
            IdentityCacheUpdate {
                first_name: Some(Some("Jane".to_string())),
                last_name: None,
                email: None,
                phone_number: None,
            }
        );

        let cleared = PhiPatch::from_map(&obj(serde_json::json!({"email": null})))
            .expect("patch should build");
        assert_eq!(
            IdentityCacheUpdate::from_patch(&cleared).and_then(|u| u.email),
            Some(None)
        );
    }

    #[test]
    fn identity_update_skipped_for_clinical_only_patch() {
        let patch = PhiPatch::from_map(&obj(serde_json::json!({"health_history": "none"})))
            .expect("patch should build");
        assert!(IdentityCacheUpdate::from_patch(&patch).is_none());
    }
}
