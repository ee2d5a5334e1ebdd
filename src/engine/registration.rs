// Registration validator: checks a join request against a session's
// configured registration fields.
//
// Pure function of (status, fields, teams, request). Exactly one error is
// reported per failed attempt so client feedback stays deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::config::{MAX_CUSTOM_FIELD_ID_CHARS, MAX_FIELD_VALUE_CHARS, NAME_MAX_CHARS, NAME_MIN_CHARS};
use super::lifecycle::{require, Operation, SessionStatus, SessionType};
use crate::error::GameError;

pub const FIELD_NAME: &str = "name";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_ORGANIZATION: &str = "organization";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Text,
    Email,
    Tel,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationField {
    pub id: String,
    pub label: String,
    pub enabled: bool,
    pub required: bool,
    #[serde(default)]
    pub placeholder: String,
    pub input_type: InputType,
}

impl RegistrationField {
    fn builtin(id: &str, label: &str, enabled: bool, input_type: InputType) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            enabled,
            required: enabled,
            placeholder: String::new(),
            input_type,
        }
    }
}

/// Fields a new session starts with.
pub fn default_fields() -> Vec<RegistrationField> {
    vec![
        RegistrationField::builtin(FIELD_NAME, "Name", true, InputType::Text),
        RegistrationField::builtin(FIELD_EMAIL, "Email", false, InputType::Email),
        RegistrationField::builtin(FIELD_ORGANIZATION, "Organization", false, InputType::Text),
    ]
}

/// Validate an admin-supplied field configuration.
pub fn validate_field_config(fields: &[RegistrationField]) -> Result<(), GameError> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.id.as_str()) {
            return Err(GameError::validation(
                "fields",
                format!("duplicate field id '{}'", field.id),
            ));
        }
        if field.label.trim().is_empty() {
            return Err(GameError::validation(
                "fields",
                format!("field '{}' needs a label", field.id),
            ));
        }
        let builtin = matches!(field.id.as_str(), FIELD_NAME | FIELD_EMAIL | FIELD_ORGANIZATION);
        if !builtin && !is_valid_custom_id(&field.id) {
            return Err(GameError::validation(
                "fields",
                format!(
                    "custom field id '{}' must be 1-{MAX_CUSTOM_FIELD_ID_CHARS} chars of [a-z0-9_]",
                    field.id
                ),
            ));
        }
        if field.id == FIELD_EMAIL && field.input_type != InputType::Email {
            return Err(GameError::validation("fields", "email field must use the email input type"));
        }
    }
    Ok(())
}

fn is_valid_custom_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CUSTOM_FIELD_ID_CHARS
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Raw join values as submitted by a player.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub organization: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
    pub team_id: Option<i64>,
}

/// A join request that passed every rule, trimmed and with team assigned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinPayload {
    /// `None` only when the session disabled the name field and none was given.
    pub name: Option<String>,
    pub email: Option<String>,
    pub organization: Option<String>,
    pub custom: BTreeMap<String, String>,
    pub team_id: Option<i64>,
}

/// Current head-count of one team, used for auto-assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamLoad {
    pub team_id: i64,
    pub players: i64,
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn find<'a>(fields: &'a [RegistrationField], id: &str) -> Option<&'a RegistrationField> {
    fields.iter().find(|f| f.id == id)
}

/// The name field is implicitly required unless explicitly disabled.
pub fn name_enabled(fields: &[RegistrationField]) -> bool {
    find(fields, FIELD_NAME).map(|f| f.enabled).unwrap_or(true)
}

fn is_required(fields: &[RegistrationField], id: &str) -> bool {
    find(fields, id).is_some_and(|f| f.enabled && f.required)
}

/// Shape check for `local@domain.tld`.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return false;
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Run the registration rules in order; the first failure wins.
pub fn validate_join(
    status: SessionStatus,
    kind: SessionType,
    fields: &[RegistrationField],
    teams: &[TeamLoad],
    req: &JoinRequest,
) -> Result<JoinPayload, GameError> {
    // 1. joinable
    require(status, Operation::Join)?;

    // 2. display name
    let name = trimmed(&req.name);
    if name_enabled(fields) || name.is_some() {
        let len = name.as_deref().map(|n| n.chars().count()).unwrap_or(0);
        if !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&len) {
            return Err(GameError::validation(
                FIELD_NAME,
                format!("must be {NAME_MIN_CHARS}-{NAME_MAX_CHARS} characters"),
            ));
        }
    }

    // 3. required fields other than name, in configuration order
    let email = trimmed(&req.email);
    let organization = trimmed(&req.organization);
    let mut custom = BTreeMap::new();
    for field in fields.iter().filter(|f| f.enabled) {
        match field.id.as_str() {
            FIELD_NAME => continue,
            FIELD_EMAIL => {
                if field.required && email.is_none() {
                    return Err(GameError::validation(FIELD_EMAIL, "is required"));
                }
            }
            FIELD_ORGANIZATION => {
                if field.required && organization.is_none() {
                    return Err(GameError::validation(FIELD_ORGANIZATION, "is required"));
                }
            }
            id => {
                let value = req
                    .custom
                    .get(id)
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty());
                match value {
                    None if field.required => {
                        return Err(GameError::validation(id, "is required"));
                    }
                    None => {}
                    Some(v) if v.chars().count() > MAX_FIELD_VALUE_CHARS => {
                        return Err(GameError::validation(
                            id,
                            format!("must be at most {MAX_FIELD_VALUE_CHARS} characters"),
                        ));
                    }
                    Some(v) => {
                        custom.insert(id.to_string(), v.to_string());
                    }
                }
            }
        }
    }

    // 4. email shape, whether or not the field is required
    if let Some(ref e) = email {
        if !is_valid_email(e) {
            return Err(GameError::validation(FIELD_EMAIL, "must look like name@example.com"));
        }
    }

    // 5. organization
    if is_required(fields, FIELD_ORGANIZATION) && organization.is_none() {
        return Err(GameError::validation(FIELD_ORGANIZATION, "is required"));
    }

    // 6. team assignment
    let team_id = match kind {
        SessionType::Individual => None,
        SessionType::TeamBattle => Some(assign_team(teams, req.team_id)?),
    };

    let email_enabled = find(fields, FIELD_EMAIL).is_some_and(|f| f.enabled);
    let organization_enabled = find(fields, FIELD_ORGANIZATION).is_some_and(|f| f.enabled);

    Ok(JoinPayload {
        name,
        email: if email_enabled { email } else { None },
        organization: if organization_enabled { organization } else { None },
        custom,
        team_id,
    })
}

/// Honour an explicit team choice, or balance onto the smallest team
/// (lowest id on ties).
pub fn assign_team(teams: &[TeamLoad], requested: Option<i64>) -> Result<i64, GameError> {
    if let Some(id) = requested {
        return if teams.iter().any(|t| t.team_id == id) {
            Ok(id)
        } else {
            Err(GameError::validation("team", "unknown team"))
        };
    }
    teams
        .iter()
        .min_by_key(|t| (t.players, t.team_id))
        .map(|t| t.team_id)
        .ok_or_else(|| GameError::validation("team", "session has no teams"))
}
