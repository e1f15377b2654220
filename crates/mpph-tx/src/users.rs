//! People CSV rows → PostHog identify records, with identity reconciliation.
//!
//! Mixpanel lets a project identify the same person both by a stable UUID and
//! by ad-hoc ids (device ids, legacy numeric ids...). PostHog should only see
//! one identity per person, so rows sharing an email are collapsed onto the
//! valid UUIDv4 among them, when there is one.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use mpph_core::{NormalizedUser, Properties, RawUserRecord};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header of the column holding Mixpanel's last activity time
pub const LAST_SEEN_HEADER: &str = "$last_seen";

/// What happens to a people CSV column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    /// Column is the record identifier, not a property
    Identifier,
    Drop,
    Rename(&'static str),
    Passthrough,
}

/// Mixpanel-reserved (`$`-prefixed) columns with a PostHog meaning
static HEADER_ACTIONS: &[(&str, HeaderAction)] = &[
    ("$distinct_id", HeaderAction::Identifier),
    ("$mp_first_event_time", HeaderAction::Drop),
    ("$timezone", HeaderAction::Rename("$geoip_time_zone")),
    ("$region", HeaderAction::Rename("$geoip_subdivision_1_name")),
    ("$country_code", HeaderAction::Rename("$geoip_country_code")),
    ("$city", HeaderAction::Rename("$geoip_city_name")),
    ("$email", HeaderAction::Rename("email")),
];

pub fn header_action(header: &str) -> HeaderAction {
    if !header.starts_with('$') {
        return HeaderAction::Passthrough;
    }
    HEADER_ACTIONS
        .iter()
        .find(|(source, _)| *source == header)
        .map(|(_, action)| *action)
        .unwrap_or(HeaderAction::Passthrough)
}

/// A syntactically valid UUID whose version nibble is 4.
pub fn is_valid_uuid_v4(id: &str) -> bool {
    Uuid::try_parse(id)
        .map(|uuid| uuid.get_version_num() == 4)
        .unwrap_or(false)
}

/// Map one CSV row into a user, before reconciliation.
///
/// The identify timestamp comes from `$last_seen` when it parses, otherwise
/// it is the current time.
pub fn map_row(row: &RawUserRecord) -> NormalizedUser {
    let mut distinct_id = String::new();
    let mut properties = Properties::new();

    for (header, value) in &row.columns {
        match header_action(header) {
            HeaderAction::Identifier => distinct_id = value.clone(),
            HeaderAction::Drop => {}
            HeaderAction::Rename(to) => {
                properties.insert(to.to_string(), Value::String(value.clone()));
            }
            HeaderAction::Passthrough => {
                properties.insert(header.clone(), Value::String(value.clone()));
            }
        }
    }

    let identify_timestamp = row
        .get(LAST_SEEN_HEADER)
        .and_then(parse_last_seen)
        .unwrap_or_else(Utc::now);

    NormalizedUser {
        distinct_id,
        properties,
        identify_timestamp,
    }
}

fn parse_last_seen(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// `email → canonical distinct_id`, built once per reconciliation run.
#[derive(Debug, Default)]
pub struct IdentityMap {
    by_email: HashMap<String, String>,
}

impl IdentityMap {
    /// Record every valid-UUID identity that carries an email.
    ///
    /// The first valid UUID seen for an email is canonical; later ones are
    /// reported and ignored so the result does not depend on which
    /// duplicate happened to come last.
    pub fn build(users: &[NormalizedUser]) -> Self {
        let mut by_email = HashMap::new();
        for user in users {
            if !is_valid_uuid_v4(&user.distinct_id) {
                continue;
            }
            let Some(email) = user.email() else {
                continue;
            };
            match by_email.entry(email.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(user.distinct_id.clone());
                }
                Entry::Occupied(slot) => {
                    if slot.get() != &user.distinct_id {
                        warn!(
                            email,
                            kept = %slot.get(),
                            ignored = %user.distinct_id,
                            "Multiple valid ids share an email; keeping the first"
                        );
                    }
                }
            }
        }
        Self { by_email }
    }

    pub fn canonical(&self, email: &str) -> Option<&str> {
        self.by_email.get(email).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}

/// Rewrite invalid identifiers onto the valid UUID sharing their email.
///
/// Rows are never dropped or reordered. Rows without an email, or whose
/// email has no valid-UUID sibling, keep their identifier.
pub fn reconcile(mut users: Vec<NormalizedUser>) -> Vec<NormalizedUser> {
    let identities = IdentityMap::build(&users);
    let mut rewritten = 0usize;

    for user in users.iter_mut() {
        if is_valid_uuid_v4(&user.distinct_id) {
            continue;
        }
        let canonical = match user.email().and_then(|email| identities.canonical(email)) {
            Some(canonical) => canonical,
            None => continue,
        };
        debug!(
            invalid = %user.distinct_id,
            valid = %canonical,
            "Replacing invalid ID with valid one"
        );
        user.distinct_id = canonical.to_string();
        rewritten += 1;
    }

    info!(
        users = users.len(),
        canonical_emails = identities.len(),
        rewritten,
        "Reconciled user identities"
    );
    users
}

/// Column mapping only; identifiers are left as they are.
pub fn users_from_rows(rows: &[RawUserRecord]) -> Vec<NormalizedUser> {
    rows.iter().map(map_row).collect()
}

/// Column mapping followed by reconciliation.
pub fn reconcile_rows(rows: &[RawUserRecord]) -> Vec<NormalizedUser> {
    reconcile(users_from_rows(rows))
}
