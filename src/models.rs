//! Core data models for the trip supervisor

use crate::error::{FailureReport, SupervisorError};
use crate::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

//
// ================= Phases =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    CollectingPreferences,
    Searching,
    Planning,
    AwaitingConfirmation,
    Scheduling,
    Sharing,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// A permanent failure in a critical phase ends the session.
    pub fn is_critical(self) -> bool {
        matches!(self, Phase::Searching | Phase::Planning)
    }

    /// Phases in which the user may still change preferences.
    pub fn accepts_preference_edits(self) -> bool {
        matches!(
            self,
            Phase::CollectingPreferences
                | Phase::Searching
                | Phase::Planning
                | Phase::AwaitingConfirmation
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::CollectingPreferences => "COLLECTING_PREFERENCES",
            Phase::Searching => "SEARCHING",
            Phase::Planning => "PLANNING",
            Phase::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Phase::Scheduling => "SCHEDULING",
            Phase::Sharing => "SHARING",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Handler identities =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HandlerId {
    Search,
    Planner,
    Calendar,
    Share,
}

impl HandlerId {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerId::Search => "search",
            HandlerId::Planner => "planner",
            HandlerId::Calendar => "calendar",
            HandlerId::Share => "share",
        }
    }

    pub fn all() -> [HandlerId; 4] {
        [
            HandlerId::Search,
            HandlerId::Planner,
            HandlerId::Calendar,
            HandlerId::Share,
        ]
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of the trip state a handler may read or write
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Preferences,
    SearchResults,
    Plan,
    History,
    CalendarStatus,
    ShareStatus,
}

impl StateField {
    pub fn as_str(self) -> &'static str {
        match self {
            StateField::Preferences => "preferences",
            StateField::SearchResults => "search_results",
            StateField::Plan => "plan",
            StateField::History => "history",
            StateField::CalendarStatus => "calendar_status",
            StateField::ShareStatus => "share_status",
        }
    }
}

//
// ================= Preferences =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceField {
    Destination,
    Days,
    StartDate,
    TravelStyle,
    Budget,
    Companion,
    AdditionalRequests,
}

impl PreferenceField {
    pub fn as_str(self) -> &'static str {
        match self {
            PreferenceField::Destination => "destination",
            PreferenceField::Days => "days",
            PreferenceField::StartDate => "start_date",
            PreferenceField::TravelStyle => "travel_style",
            PreferenceField::Budget => "budget",
            PreferenceField::Companion => "companion",
            PreferenceField::AdditionalRequests => "additional_requests",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "destination" => Some(PreferenceField::Destination),
            "days" | "duration" => Some(PreferenceField::Days),
            "start_date" | "departure_date" => Some(PreferenceField::StartDate),
            "travel_style" | "style" => Some(PreferenceField::TravelStyle),
            "budget" => Some(PreferenceField::Budget),
            "companion" | "companion_type" => Some(PreferenceField::Companion),
            "additional_requests" => Some(PreferenceField::AdditionalRequests),
            _ => None,
        }
    }
}

impl fmt::Display for PreferenceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TravelStyle {
    Culture,
    Nature,
    Food,
    Shopping,
    Activity,
    Photo,
}

impl TravelStyle {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "culture" | "history" => Some(TravelStyle::Culture),
            "nature" | "healing" => Some(TravelStyle::Nature),
            "food" => Some(TravelStyle::Food),
            "shopping" | "city" => Some(TravelStyle::Shopping),
            "activity" | "adventure" => Some(TravelStyle::Activity),
            "photo" => Some(TravelStyle::Photo),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TravelStyle::Culture => "culture",
            TravelStyle::Nature => "nature",
            TravelStyle::Food => "food",
            TravelStyle::Shopping => "shopping",
            TravelStyle::Activity => "activity",
            TravelStyle::Photo => "photo",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BudgetTier {
    Budget,
    Moderate,
    Comfortable,
    Luxury,
    Unlimited,
}

impl BudgetTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "budget" | "low" => Some(BudgetTier::Budget),
            "moderate" | "medium" => Some(BudgetTier::Moderate),
            "comfortable" | "high" => Some(BudgetTier::Comfortable),
            "luxury" => Some(BudgetTier::Luxury),
            "unlimited" => Some(BudgetTier::Unlimited),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BudgetTier::Budget => "budget",
            BudgetTier::Moderate => "moderate",
            BudgetTier::Comfortable => "comfortable",
            BudgetTier::Luxury => "luxury",
            BudgetTier::Unlimited => "unlimited",
        }
    }

    /// Rough per-activity spend used by cost estimates
    pub fn activity_cost(self) -> u32 {
        match self {
            BudgetTier::Budget => 10_000,
            BudgetTier::Moderate => 25_000,
            BudgetTier::Comfortable => 45_000,
            BudgetTier::Luxury => 80_000,
            BudgetTier::Unlimited => 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompanionType {
    Solo,
    Couple,
    Family,
    Friends,
    Group,
}

impl CompanionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "solo" | "alone" => Some(CompanionType::Solo),
            "couple" | "partner" => Some(CompanionType::Couple),
            "family" => Some(CompanionType::Family),
            "friends" => Some(CompanionType::Friends),
            "group" => Some(CompanionType::Group),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompanionType::Solo => "solo",
            CompanionType::Couple => "couple",
            CompanionType::Family => "family",
            CompanionType::Friends => "friends",
            CompanionType::Group => "group",
        }
    }
}

/// Named preference fields mapped to normalised JSON values.
///
/// Values are validated and normalised on the way in, so everything stored
/// here is already in canonical form (budget tiers by their canonical name,
/// travel styles as an array of tags, days as a positive integer).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Preferences(BTreeMap<PreferenceField, Value>);

impl Preferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: PreferenceField) -> Option<&Value> {
        self.0.get(&field)
    }

    pub fn contains(&self, field: PreferenceField) -> bool {
        self.0.contains_key(&field)
    }

    pub fn destination(&self) -> Option<&str> {
        self.get(PreferenceField::Destination).and_then(Value::as_str)
    }

    pub fn days(&self) -> Option<u32> {
        self.get(PreferenceField::Days)
            .and_then(Value::as_u64)
            .map(|d| d as u32)
    }

    pub fn start_date(&self) -> Option<NaiveDate> {
        self.get(PreferenceField::StartDate)
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }

    pub fn budget(&self) -> Option<BudgetTier> {
        self.get(PreferenceField::Budget)
            .and_then(Value::as_str)
            .and_then(BudgetTier::parse)
    }

    pub fn companion(&self) -> Option<CompanionType> {
        self.get(PreferenceField::Companion)
            .and_then(Value::as_str)
            .and_then(CompanionType::parse)
    }

    pub fn travel_styles(&self) -> Vec<TravelStyle> {
        self.get(PreferenceField::TravelStyle)
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .filter_map(TravelStyle::parse)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Required fields that are still missing, in declaration order
    pub fn missing(&self, required: &[PreferenceField]) -> Vec<PreferenceField> {
        required
            .iter()
            .copied()
            .filter(|field| !self.contains(*field))
            .collect()
    }

    pub(crate) fn set(&mut self, field: PreferenceField, value: Value) {
        self.0.insert(field, value);
    }
}

/// Validate a raw preference value and return its canonical form
pub fn normalize_preference(field: PreferenceField, value: &Value) -> Result<Value> {
    let invalid = |reason: &str| {
        SupervisorError::InvalidPreference(format!("{}: {} (got {})", field, reason, value))
    };

    match field {
        PreferenceField::Destination => {
            let name = value
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid("expected a non-empty string"))?;
            Ok(Value::String(name.to_string()))
        }
        PreferenceField::Days => {
            let days = value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
                .filter(|d| (1..=30).contains(d))
                .ok_or_else(|| invalid("expected a number of days between 1 and 30"))?;
            Ok(Value::from(days))
        }
        PreferenceField::StartDate => {
            let raw = value
                .as_str()
                .ok_or_else(|| invalid("expected a YYYY-MM-DD date"))?;
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .map_err(|_| invalid("expected a YYYY-MM-DD date"))?;
            Ok(Value::String(date.format("%Y-%m-%d").to_string()))
        }
        PreferenceField::TravelStyle => {
            let raw: Vec<&str> = match value {
                Value::String(s) => s.split(',').collect(),
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => return Err(invalid("expected a style tag or a list of tags")),
            };
            let mut tags: Vec<Value> = Vec::with_capacity(raw.len());
            for tag in raw {
                let style = TravelStyle::parse(tag).ok_or_else(|| invalid("unknown travel style"))?;
                let canonical = Value::String(style.as_str().to_string());
                if !tags.contains(&canonical) {
                    tags.push(canonical);
                }
            }
            if tags.is_empty() {
                return Err(invalid("expected at least one travel style"));
            }
            Ok(Value::Array(tags))
        }
        PreferenceField::Budget => value
            .as_str()
            .and_then(BudgetTier::parse)
            .map(|tier| Value::String(tier.as_str().to_string()))
            .ok_or_else(|| invalid("unknown budget tier")),
        PreferenceField::Companion => value
            .as_str()
            .and_then(CompanionType::parse)
            .map(|c| Value::String(c.as_str().to_string()))
            .ok_or_else(|| invalid("unknown companion type")),
        PreferenceField::AdditionalRequests => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| invalid("expected a string")),
    }
}

//
// ================= Search & Plan =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchItem {
    pub name: String,
    pub category: String,
    pub location: String,
    pub description: String,
    #[serde(default)]
    pub rating: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    /// Local start time, `HH:MM`
    pub time: String,
    pub name: String,
    pub location: String,
    pub category: String,
    pub estimated_cost: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayEntry {
    pub day_number: u32,
    #[serde(default)]
    pub date: Option<String>,
    pub activities: Vec<Activity>,
}

impl DayEntry {
    /// Summed in `u64`; remote planners may send any `u32` cost
    pub fn total_cost(&self) -> u64 {
        self.activities.iter().map(|a| u64::from(a.estimated_cost)).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub title: String,
    pub days: Vec<DayEntry>,
}

impl Plan {
    pub fn total_cost(&self) -> u64 {
        self.days
            .iter()
            .map(DayEntry::total_cost)
            .fold(0, u64::saturating_add)
    }

    pub fn activity_count(&self) -> usize {
        self.days.iter().map(|d| d.activities.len()).sum()
    }
}

//
// ================= Step status =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    NotAttempted,
    InProgress,
    Succeeded { detail: String },
    Skipped,
    Failed { reason: String },
}

//
// ================= History =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    Supervisor,
    Handler(HandlerId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    Message { text: String },
    Question { text: String },
    Result { summary: String },
    Failure { failure: FailureReport },
    PhaseChange { from: Phase, to: Phase },
    Note { text: String },
}

/// One entry of the append-only session log.
///
/// Entries are stamped with the turn they belong to rather than wall-clock
/// time; timestamps live in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub turn: u32,
    pub actor: Actor,
    pub event: HistoryEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingQuestion {
    pub handler: HandlerId,
    pub question: String,
}

//
// ================= User input =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub preferences: BTreeMap<PreferenceField, Value>,
}

impl UserInput {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            preferences: BTreeMap::new(),
        }
    }

    pub fn with_preference(mut self, field: PreferenceField, value: impl Into<Value>) -> Self {
        self.preferences.insert(field, value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmDecision {
    Accept,
    Revise,
}
