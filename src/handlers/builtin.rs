//! Built-in handlers
//!
//! Deterministic stand-ins for the real search/planning/calendar/share
//! services. They keep the supervisor runnable end to end without any
//! external dependency, and they honour the handler contract: same view
//! and directive in, same outcome out.

use super::{Handler, HandlerDescriptor, HandlerOutcome};
use crate::models::{
    Activity, BudgetTier, DayEntry, HandlerId, Plan, Preferences, SearchItem, StepStatus,
};
use crate::state::{Directive, StateUpdate, StateView};
use chrono::Duration as ChronoDuration;
use tracing::debug;

//
// ================= Search =================
//

const CATALOG: &[(&str, &str, &str, &str, f32)] = &[
    ("busan", "Haeundae Beach", "nature", "Wide sandy beach with a seaside promenade", 4.6),
    ("busan", "Gamcheon Culture Village", "photo", "Hillside village of painted houses", 4.5),
    ("busan", "Jagalchi Fish Market", "food", "Korea's largest seafood market", 4.4),
    ("busan", "Beomeosa Temple", "culture", "Mountain temple founded in 678", 4.6),
    ("busan", "Seomyeon Shopping Street", "shopping", "Underground malls and street stalls", 4.2),
    ("busan", "Songdo Sky Walk", "activity", "Ocean walkway and cable car", 4.3),
    ("seoul", "Gyeongbokgung Palace", "culture", "Main royal palace of the Joseon dynasty", 4.7),
    ("seoul", "Gwangjang Market", "food", "Historic market famous for bindaetteok", 4.5),
    ("seoul", "Bukchon Hanok Village", "photo", "Traditional houses between two palaces", 4.4),
    ("seoul", "Myeongdong", "shopping", "Cosmetics shops and street food", 4.3),
    ("seoul", "Bukhansan National Park", "nature", "Granite peaks inside the city limits", 4.7),
    ("jeju", "Seongsan Ilchulbong", "nature", "Volcanic tuff cone with sunrise views", 4.8),
    ("jeju", "Dongmun Market", "food", "Tangerines, black pork and night stalls", 4.4),
    ("jeju", "Hallasan", "activity", "Hike to the highest peak in South Korea", 4.7),
    ("jeju", "Jeju Folk Village", "culture", "Recreated island village life", 4.2),
    ("gyeongju", "Bulguksa Temple", "culture", "UNESCO-listed Silla temple", 4.8),
    ("gyeongju", "Donggung Palace and Wolji Pond", "photo", "Palace ruins lit up at night", 4.7),
    ("gyeongju", "Hwangnidan-gil", "food", "Cafe street among hanok roofs", 4.3),
];

/// Looks candidates up in a small built-in catalogue
pub struct CatalogSearchHandler {
    descriptor: HandlerDescriptor,
}

impl CatalogSearchHandler {
    pub fn new() -> Self {
        Self {
            descriptor: HandlerDescriptor::standard(HandlerId::Search),
        }
    }
}

impl Default for CatalogSearchHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn fallback_places(destination: &str) -> Vec<SearchItem> {
    [
        ("Old Town", "culture", "Historic centre"),
        ("Central Market", "food", "Local market with street food"),
        ("Riverside Park", "nature", "Green space for a slow afternoon"),
    ]
    .iter()
    .map(|(suffix, category, description)| SearchItem {
        name: format!("{} {}", destination, suffix),
        category: category.to_string(),
        location: destination.to_string(),
        description: description.to_string(),
        rating: None,
    })
    .collect()
}

pub(crate) fn search_catalog(preferences: &Preferences) -> Option<Vec<SearchItem>> {
    let destination = preferences.destination()?;
    let key = destination.to_lowercase();

    let mut items: Vec<SearchItem> = CATALOG
        .iter()
        .filter(|(city, ..)| *city == key)
        .map(|(_, name, category, description, rating)| SearchItem {
            name: name.to_string(),
            category: category.to_string(),
            location: destination.to_string(),
            description: description.to_string(),
            rating: Some(*rating),
        })
        .collect();

    if items.is_empty() {
        items = fallback_places(destination);
    }

    let styles: Vec<&str> = preferences
        .travel_styles()
        .into_iter()
        .map(|s| s.as_str())
        .collect();
    if !styles.is_empty() {
        // stable: preferred styles first, catalogue order otherwise
        items.sort_by_key(|item| !styles.contains(&item.category.as_str()));
    }

    Some(items)
}

#[async_trait::async_trait]
impl Handler for CatalogSearchHandler {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, view: &StateView, _directive: &Directive) -> HandlerOutcome {
        let Some(preferences) = view.preferences.as_ref() else {
            return HandlerOutcome::permanent("search requires preferences");
        };

        match search_catalog(preferences) {
            Some(items) => {
                debug!(count = items.len(), "catalog search complete");
                HandlerOutcome::update(StateUpdate::search_results(items))
            }
            None => HandlerOutcome::needs_input("Where would you like to travel?"),
        }
    }
}

//
// ================= Planning =================
//

const SLOTS: [&str; 4] = ["09:00", "12:00", "14:30", "18:30"];

/// Fills each day with catalogue results, round-robin
pub struct TemplatePlanner {
    descriptor: HandlerDescriptor,
}

impl TemplatePlanner {
    pub fn new() -> Self {
        Self {
            descriptor: HandlerDescriptor::standard(HandlerId::Planner),
        }
    }
}

impl Default for TemplatePlanner {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn build_plan(preferences: &Preferences, results: &[SearchItem]) -> Plan {
    let destination = preferences.destination().unwrap_or("your destination");
    let days = preferences.days().unwrap_or(1).max(1);
    let tier = preferences.budget().unwrap_or(BudgetTier::Moderate);
    let start = preferences.start_date();

    let mut cursor = 0usize;
    let day_entries = (1..=days)
        .map(|day_number| {
            let activities = SLOTS
                .iter()
                .map(|time| {
                    let item = if results.is_empty() {
                        None
                    } else {
                        let item = &results[cursor % results.len()];
                        cursor += 1;
                        Some(item)
                    };
                    match item {
                        Some(item) => Activity {
                            time: time.to_string(),
                            name: item.name.clone(),
                            location: item.location.clone(),
                            category: item.category.clone(),
                            estimated_cost: if item.category == "food" {
                                tier.activity_cost() / 2
                            } else {
                                tier.activity_cost()
                            },
                        },
                        None => Activity {
                            time: time.to_string(),
                            name: format!("Free time in {}", destination),
                            location: destination.to_string(),
                            category: "free".to_string(),
                            estimated_cost: 0,
                        },
                    }
                })
                .collect();

            DayEntry {
                day_number,
                date: start.map(|d| {
                    (d + ChronoDuration::days(i64::from(day_number) - 1))
                        .format("%Y-%m-%d")
                        .to_string()
                }),
                activities,
            }
        })
        .collect();

    Plan {
        title: format!("{}-day trip to {}", days, destination),
        days: day_entries,
    }
}

#[async_trait::async_trait]
impl Handler for TemplatePlanner {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, view: &StateView, _directive: &Directive) -> HandlerOutcome {
        let (Some(preferences), Some(results)) =
            (view.preferences.as_ref(), view.search_results.as_ref())
        else {
            return HandlerOutcome::permanent("planning requires preferences and search results");
        };

        HandlerOutcome::update(StateUpdate::plan(build_plan(preferences, results)))
    }
}

//
// ================= Calendar =================
//

/// Exports the confirmed itinerary as iCalendar events
pub struct IcsCalendarHandler {
    descriptor: HandlerDescriptor,
}

impl IcsCalendarHandler {
    pub fn new() -> Self {
        Self {
            descriptor: HandlerDescriptor::standard(HandlerId::Calendar),
        }
    }
}

impl Default for IcsCalendarHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the plan as an RFC 5545 iCalendar document. `None` if any day is
/// undated.
///
/// DTSTAMP is pinned to the first day of the trip rather than the wall clock,
/// so the same plan always renders the same document.
pub fn render_ics(plan: &Plan) -> Option<String> {
    let dates = plan
        .days
        .iter()
        .map(|day| day.date.as_deref().map(|d| d.replace('-', "")))
        .collect::<Option<Vec<String>>>()?;
    let stamp = format!("{}T000000Z", dates.first().map(String::as_str).unwrap_or("19700101"));

    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//trip-supervisor//EN".to_string(),
    ];

    for (day, date) in plan.days.iter().zip(&dates) {
        for (i, activity) in day.activities.iter().enumerate() {
            let time = activity.time.replace(':', "");
            lines.push("BEGIN:VEVENT".to_string());
            lines.push(format!("UID:{}-{}@trip-supervisor", day.day_number, i + 1));
            lines.push(format!("DTSTAMP:{}", stamp));
            lines.push(format!("DTSTART:{}T{}00", date, time));
            lines.push(format!("SUMMARY:{}", escape_text(&activity.name)));
            lines.push(format!("LOCATION:{}", escape_text(&activity.location)));
            lines.push("END:VEVENT".to_string());
        }
    }
    lines.push("END:VCALENDAR".to_string());

    let mut out = String::new();
    for line in &lines {
        out.push_str(&fold_line(line));
        out.push_str("\r\n");
    }
    Some(out)
}

/// Escape a TEXT property value
fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Fold a content line at 75 octets without splitting a UTF-8 sequence
fn fold_line(line: &str) -> String {
    const LIMIT: usize = 75;

    let mut out = String::with_capacity(line.len() + line.len() / LIMIT * 3);
    let mut width = 0;
    for c in line.chars() {
        let len = c.len_utf8();
        if width + len > LIMIT {
            out.push_str("\r\n ");
            // the leading space counts toward the continuation line
            width = 1;
        }
        out.push(c);
        width += len;
    }
    out
}

#[async_trait::async_trait]
impl Handler for IcsCalendarHandler {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, view: &StateView, _directive: &Directive) -> HandlerOutcome {
        let Some(plan) = view.plan.as_ref() else {
            return HandlerOutcome::permanent("no confirmed plan to schedule");
        };

        match render_ics(plan) {
            Some(ics) => {
                debug!(
                    events = plan.activity_count(),
                    bytes = ics.len(),
                    "rendered calendar export"
                );
                HandlerOutcome::update(StateUpdate::calendar_status(StepStatus::Succeeded {
                    detail: ics,
                }))
            }
            None => HandlerOutcome::permanent(
                "itinerary has no dates; set a start_date to schedule it",
            ),
        }
    }
}

//
// ================= Share =================
//

/// Produces a plain-text summary ready to paste into a messenger
pub struct SummaryShareHandler {
    descriptor: HandlerDescriptor,
}

impl SummaryShareHandler {
    pub fn new() -> Self {
        Self {
            descriptor: HandlerDescriptor::standard(HandlerId::Share),
        }
    }
}

impl Default for SummaryShareHandler {
    fn default() -> Self {
        Self::new()
    }
}

pub fn summarize_plan(plan: &Plan) -> String {
    let mut out = format!("{}\n", plan.title);
    for day in &plan.days {
        match &day.date {
            Some(date) => out.push_str(&format!("Day {} ({})\n", day.day_number, date)),
            None => out.push_str(&format!("Day {}\n", day.day_number)),
        }
        for activity in &day.activities {
            out.push_str(&format!(
                "  {} {} @ {}\n",
                activity.time, activity.name, activity.location
            ));
        }
    }
    out.push_str(&format!("Estimated total: {} KRW", plan.total_cost()));
    out
}

#[async_trait::async_trait]
impl Handler for SummaryShareHandler {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, view: &StateView, _directive: &Directive) -> HandlerOutcome {
        match view.plan.as_ref() {
            Some(plan) => HandlerOutcome::update(StateUpdate::share_status(StepStatus::Succeeded {
                detail: summarize_plan(plan),
            })),
            None => HandlerOutcome::permanent("no confirmed plan to share"),
        }
    }
}
