//! Walk racecard and results payloads into typed entities.
//!
//! Upstream shapes are not contractual, so every accessor here is lenient:
//! entries that are not objects are skipped, missing identifiers are
//! synthesized from the parent id and position.

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::flatten::{flatten_json, Facts};

type Object = Map<String, Value>;

const ID_FIELDS: [&str; 5] = ["id", "uuid", "runner_id", "race_id", "meeting_id"];
const LIST_KEYS: [&str; 5] = ["data", "meetings", "races", "results", "racecards"];

/// Entity type tag, resolved once per object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Meeting,
    Race,
    Runner,
    Result,
    Horse,
    Trainer,
    Jockey,
    /// Nested object with no recognizable type, named after its field.
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKind::Meeting => "meeting",
            EntityKind::Race => "race",
            EntityKind::Runner => "runner",
            EntityKind::Result => "result",
            EntityKind::Horse => "horse",
            EntityKind::Trainer => "trainer",
            EntityKind::Jockey => "jockey",
            EntityKind::Other(name) => name,
        }
    }

    fn known(name: &str) -> Option<Self> {
        match name {
            "horse" => Some(EntityKind::Horse),
            "trainer" => Some(EntityKind::Trainer),
            "jockey" => Some(EntityKind::Jockey),
            "runner" => Some(EntityKind::Runner),
            "race" => Some(EntityKind::Race),
            "meeting" => Some(EntityKind::Meeting),
            _ => None,
        }
    }

    /// Resolve the type of an object found under `field_key` in a runner.
    ///
    /// Rules, first match wins: explicit `type`/`entity_type` naming a known
    /// kind, then key-name hints for horse/trainer/jockey, then the field key.
    pub fn infer(field_key: &str, obj: &Object) -> Self {
        let explicit = ["type", "entity_type"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(scalar_text))
            .map(|s| s.to_lowercase());
        if let Some(kind) = explicit.as_deref().and_then(Self::known) {
            return kind;
        }

        for (name, kind) in [
            ("horse", EntityKind::Horse),
            ("trainer", EntityKind::Trainer),
            ("jockey", EntityKind::Jockey),
        ] {
            let prefix = format!("{name}_");
            if obj.contains_key(name) || obj.keys().any(|k| k.starts_with(&prefix)) {
                return kind;
            }
        }

        let lower = field_key.to_lowercase();
        Self::known(&lower).unwrap_or(EntityKind::Other(lower))
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// EAV anchor for any extracted object.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    pub parent_id: Option<String>,
    pub meeting_date: Option<String>,
    pub country: Option<String>,
    pub raw: Value,
}

impl EntityRecord {
    pub fn facts(&self) -> Facts {
        flatten_json(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeetingRow {
    pub meeting_id: String,
    pub meeting_date: String,
    pub country: String,
    pub venue: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaceRow {
    pub race_id: String,
    pub meeting_id: String,
    pub race_no: Option<i64>,
    pub scheduled_start_time: Option<String>,
    pub distance: Option<String>,
    pub class: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunnerRow {
    pub runner_id: String,
    pub race_id: String,
    pub runner_name: Option<String>,
    pub barrier: Option<i64>,
    pub weight: Option<String>,
    pub jockey: Option<String>,
    pub trainer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub race_id: String,
    pub status: Option<String>,
    pub winner_runner_id: Option<String>,
    /// Compact JSON of the finish-order list (`[]` when absent).
    pub finish_order: String,
}

/// Row for one of the structured tables.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredRow {
    Meeting(MeetingRow),
    Race(RaceRow),
    Runner(RunnerRow),
    Result(ResultRow),
}

/// Unit of persistence: the structured row (if the object has a table of
/// its own) plus its entity record.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub row: Option<StructuredRow>,
    pub entity: EntityRecord,
}

/// Run-wide inputs for defaults.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    pub date: NaiveDate,
    pub regions: &'a [String],
}

impl ExtractContext<'_> {
    fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

/// Top-level records of a payload: a bare list, or the first list found under
/// one of the usual wrapper keys. Non-object entries are dropped.
pub fn extract_list(payload: &Value) -> Vec<&Object> {
    let list = match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => LIST_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array)),
        _ => None,
    };
    list.map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

/// Meeting, its races, their runners and the runners' nested objects, parents
/// before children.
pub fn extract_meeting(meeting: &Object, index: usize, ctx: &ExtractContext<'_>) -> Vec<Extracted> {
    let meeting_id = find_id(meeting, &["meeting_id", "track_id", "venue_id"])
        .unwrap_or_else(|| format!("m_{}_{}", ctx.date_string(), index));
    let meeting_date =
        first_text(meeting, &["meeting_date", "date"]).unwrap_or_else(|| ctx.date_string());
    let country = first_text(meeting, &["country"])
        .or_else(|| ctx.regions.first().cloned())
        .unwrap_or_default();
    let venue = first_text(meeting, &["venue", "track"]).unwrap_or_default();

    let mut out = vec![Extracted {
        row: Some(StructuredRow::Meeting(MeetingRow {
            meeting_id: meeting_id.clone(),
            meeting_date: meeting_date.clone(),
            country: country.clone(),
            venue,
        })),
        entity: EntityRecord {
            kind: EntityKind::Meeting,
            id: meeting_id.clone(),
            parent_id: None,
            meeting_date: Some(meeting_date.clone()),
            country: Some(country.clone()),
            raw: Value::Object(meeting.clone()),
        },
    }];

    let scope = Scope {
        meeting_date: &meeting_date,
        country: &country,
    };
    for (n, race) in child_objects(meeting, "races").enumerate() {
        extract_race(race, n + 1, &meeting_id, &scope, &mut out);
    }
    out
}

struct Scope<'a> {
    meeting_date: &'a str,
    country: &'a str,
}

impl Scope<'_> {
    fn entity(&self, kind: EntityKind, id: &str, parent: &str, raw: &Object) -> EntityRecord {
        EntityRecord {
            kind,
            id: id.to_string(),
            parent_id: Some(parent.to_string()),
            meeting_date: Some(self.meeting_date.to_string()),
            country: Some(self.country.to_string()),
            raw: Value::Object(raw.clone()),
        }
    }
}

fn extract_race(
    race: &Object,
    ordinal: usize,
    meeting_id: &str,
    scope: &Scope<'_>,
    out: &mut Vec<Extracted>,
) {
    let race_id = find_id(race, &["race_id"]).unwrap_or_else(|| format!("{meeting_id}_r{ordinal}"));
    out.push(Extracted {
        row: Some(StructuredRow::Race(RaceRow {
            race_id: race_id.clone(),
            meeting_id: meeting_id.to_string(),
            race_no: first_int(race, &["race_no", "number"]),
            scheduled_start_time: first_text(race, &["scheduled_start_time", "off_time", "start_time"]),
            distance: first_text(race, &["distance"]),
            class: first_text(race, &["class", "grade"]),
        })),
        entity: scope.entity(EntityKind::Race, &race_id, meeting_id, race),
    });

    for (n, runner) in child_objects(race, "runners").enumerate() {
        extract_runner(runner, n + 1, &race_id, scope, out);
    }
}

fn extract_runner(
    runner: &Object,
    ordinal: usize,
    race_id: &str,
    scope: &Scope<'_>,
    out: &mut Vec<Extracted>,
) {
    let runner_id =
        find_id(runner, &["runner_id", "horse_id"]).unwrap_or_else(|| format!("{race_id}_ru{ordinal}"));
    out.push(Extracted {
        row: Some(StructuredRow::Runner(RunnerRow {
            runner_id: runner_id.clone(),
            race_id: race_id.to_string(),
            runner_name: first_text(runner, &["runner_name", "name"]),
            barrier: first_int(runner, &["barrier", "draw"]),
            weight: first_text(runner, &["weight"]),
            jockey: person_name(runner, "jockey"),
            trainer: person_name(runner, "trainer"),
        })),
        entity: scope.entity(EntityKind::Runner, &runner_id, race_id, runner),
    });

    for (key, value) in runner {
        let Some(nested) = value.as_object() else {
            continue;
        };
        let kind = EntityKind::infer(key, nested);
        let kind_id = format!("{}_id", kind.as_str());
        let nested_id = find_id(nested, &[kind_id.as_str(), "id"])
            .unwrap_or_else(|| format!("{runner_id}_{key}"));
        out.push(Extracted {
            row: None,
            entity: scope.entity(kind, &nested_id, &runner_id, nested),
        });
    }
}

/// One result per race-identified row; rows without a race id are skipped.
pub fn extract_results(payload: &Value, ctx: &ExtractContext<'_>) -> Vec<Extracted> {
    extract_list(payload)
        .into_iter()
        .filter_map(|row| extract_result(row, ctx))
        .collect()
}

fn extract_result(row: &Object, ctx: &ExtractContext<'_>) -> Option<Extracted> {
    let race_id = row
        .get("race_id")
        .and_then(id_text)
        .or_else(|| find_id(row, &["race_id"]))?;

    let finish_order = ["finish_order", "placing", "positions"]
        .iter()
        .filter_map(|k| row.get(*k))
        .find(|v| truthy(v))
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));

    let winner_runner_id = row
        .get("winner_runner_id")
        .and_then(id_text)
        .or_else(|| match finish_order.as_array().and_then(|items| items.first()) {
            Some(Value::Object(top)) => top.get("runner_id").and_then(id_text),
            Some(top) => id_text(top),
            None => None,
        });

    Some(Extracted {
        row: Some(StructuredRow::Result(ResultRow {
            race_id: race_id.clone(),
            status: first_text(row, &["status"]),
            winner_runner_id,
            finish_order: finish_order.to_string(),
        })),
        entity: EntityRecord {
            kind: EntityKind::Result,
            id: race_id.clone(),
            parent_id: Some(race_id),
            meeting_date: Some(ctx.date_string()),
            country: None,
            raw: Value::Object(row.clone()),
        },
    })
}

fn child_objects<'a>(obj: &'a Object, key: &str) -> impl Iterator<Item = &'a Object> {
    obj.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// First usable identifier: the generic id fields, then `fallbacks`.
fn find_id(obj: &Object, fallbacks: &[&str]) -> Option<String> {
    ID_FIELDS
        .iter()
        .chain(fallbacks.iter())
        .find_map(|k| obj.get(*k).and_then(id_text))
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn first_text(obj: &Object, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(*k).and_then(scalar_text))
}

fn first_int(obj: &Object, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// `jockey: "J Smith"` or `jockey: {"name": "J Smith", ...}`.
fn person_name(runner: &Object, key: &str) -> Option<String> {
    match runner.get(key)? {
        Value::Object(nested) => first_text(nested, &["name"]),
        other => scalar_text(other),
    }
}
