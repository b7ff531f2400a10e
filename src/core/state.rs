//! Game state tracking
//!
//! `GameState` is the reference consumer of the event bus: it subscribes to
//! the metadata topics it cares about and keeps the latest hands, vitals,
//! timers, compass and status indicators.

use crate::core::event_bus::{EventBus, Subscription};
use crate::data::Element;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Vitals reported through progressBar tags
pub const VITALS: [&str; 4] = ["health", "mana", "stamina", "spirit"];

/// Status icons tracked from indicator / dialogData tags
const STATUS_ICONS: [&str; 11] = [
    "IconSTANDING",
    "IconKNEELING",
    "IconSITTING",
    "IconPRONE",
    "IconSTUNNED",
    "IconBLEEDING",
    "IconHIDDEN",
    "IconINVISIBLE",
    "IconWEBBED",
    "IconJOINED",
    "IconDEAD",
];

/// Game session state
#[derive(Clone, Debug, Serialize)]
pub struct GameState {
    /// Current room ID (from nav)
    pub room_id: Option<String>,

    /// Room title (streamWindow subtitle)
    pub room_name: Option<String>,

    /// Roundtime end timestamp (local Unix time)
    pub roundtime_end: Option<i64>,

    /// Casttime end timestamp (local Unix time)
    pub casttime_end: Option<i64>,

    /// Server time minus local time, learned from prompts
    pub server_time_offset: i64,

    /// Current spell being prepared
    pub spell: Option<String>,

    /// Player status indicators
    pub status: StatusInfo,

    /// Vitals (health, mana, etc.)
    pub vitals: Vitals,

    /// Current left hand item
    pub left_hand: Option<String>,

    /// Current right hand item
    pub right_hand: Option<String>,

    /// Compass directions
    pub compass_dirs: Vec<String>,

    /// Last prompt text
    pub last_prompt: String,

    /// Metadata updates applied, by tag name
    pub updates: HashMap<String, u64>,
}

/// Player status information
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    pub standing: bool,
    pub kneeling: bool,
    pub sitting: bool,
    pub prone: bool,
    pub stunned: bool,
    pub bleeding: bool,
    pub hidden: bool,
    pub invisible: bool,
    pub webbed: bool,
    pub joined: bool,
    pub dead: bool,
}

impl StatusInfo {
    fn flag_mut(&mut self, icon: &str) -> Option<&mut bool> {
        let flag = match icon.strip_prefix("Icon").unwrap_or(icon).to_lowercase().as_str() {
            "standing" => &mut self.standing,
            "kneeling" => &mut self.kneeling,
            "sitting" => &mut self.sitting,
            "prone" => &mut self.prone,
            "stunned" => &mut self.stunned,
            "bleeding" => &mut self.bleeding,
            "hidden" => &mut self.hidden,
            "invisible" => &mut self.invisible,
            "webbed" => &mut self.webbed,
            "joined" => &mut self.joined,
            "dead" => &mut self.dead,
            _ => return None,
        };
        Some(flag)
    }
}

/// One vital bar
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Vital {
    pub percent: u8,
    pub current: u32,
    pub max: u32,
}

impl Default for Vital {
    fn default() -> Self {
        Self {
            percent: 100,
            current: 100,
            max: 100,
        }
    }
}

/// Player vitals
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Vitals {
    pub health: Vital,
    pub mana: Vital,
    pub stamina: Vital,
    pub spirit: Vital,
}

impl Vitals {
    fn get_mut(&mut self, id: &str) -> Option<&mut Vital> {
        match id {
            "health" => Some(&mut self.health),
            "mana" => Some(&mut self.mana),
            "stamina" => Some(&mut self.stamina),
            "spirit" => Some(&mut self.spirit),
            _ => None,
        }
    }
}

impl GameState {
    pub fn new() -> Self {
        Self {
            room_id: None,
            room_name: None,
            roundtime_end: None,
            casttime_end: None,
            server_time_offset: 0,
            spell: None,
            status: StatusInfo::default(),
            vitals: Vitals::default(),
            left_hand: None,
            right_hand: None,
            compass_dirs: Vec::new(),
            last_prompt: String::from(">"), // Default prompt
            updates: HashMap::new(),
        }
    }

    /// Topics `attach` subscribes to
    pub fn topics() -> Vec<String> {
        let mut topics: Vec<String> = [
            "left",
            "right",
            "spell",
            "prompt",
            "roundTime",
            "castTime",
            "compass",
            "nav",
        ]
        .iter()
        .map(|name| format!("metadata/{}", name))
        .collect();
        topics.push("metadata/streamWindow/room".to_string());
        topics.push("metadata/dialogData/minivitals".to_string());
        topics.extend(VITALS.iter().map(|id| format!("metadata/progressBar/{}", id)));
        for icon in STATUS_ICONS {
            topics.push(format!("metadata/indicator/{}", icon));
            topics.push(format!("metadata/dialogData/{}", icon));
        }
        topics
    }

    /// Subscribe a shared state to every topic it tracks
    pub fn attach(state: Arc<Mutex<GameState>>, bus: &EventBus) -> Vec<Subscription> {
        Self::topics()
            .into_iter()
            .map(|topic| {
                let state = Arc::clone(&state);
                let key = topic.clone();
                bus.subscribe(&topic, move |payload| {
                    let state = Arc::clone(&state);
                    let key = key.clone();
                    async move {
                        let mut state = state
                            .lock()
                            .map_err(|_| anyhow::anyhow!("game state lock poisoned"))?;
                        state.apply(&key, &payload);
                        anyhow::Ok(())
                    }
                })
            })
            .collect()
    }

    /// Apply one metadata publication
    pub fn apply(&mut self, topic: &str, element: &Element) {
        let Some(rest) = topic.strip_prefix("metadata/") else {
            return;
        };
        let (name, id) = match rest.split_once('/') {
            Some((name, id)) => (name, Some(id)),
            None => (rest, None),
        };
        *self.updates.entry(name.to_string()).or_insert(0) += 1;

        match name {
            "left" => self.left_hand = non_empty(element.plain_text()),
            "right" => self.right_hand = non_empty(element.plain_text()),
            "spell" => {
                self.spell = non_empty(element.plain_text()).filter(|s| s != "None");
            }
            "prompt" => self.handle_prompt(element),
            "roundTime" => self.roundtime_end = self.local_end_time(element),
            "castTime" => self.casttime_end = self.local_end_time(element),
            "compass" => {
                self.compass_dirs = element
                    .children()
                    .iter()
                    .filter(|c| c.name() == "dir")
                    .filter_map(|c| c.attr("value"))
                    .map(|v| v.to_string())
                    .collect();
            }
            "nav" => {
                if let Some(rm) = element.attr("rm") {
                    self.room_id = Some(rm.to_string());
                }
            }
            "streamWindow" => {
                if let Some(subtitle) = element.attr("subtitle") {
                    let title = subtitle.trim_start_matches(" - ").trim();
                    self.room_name = non_empty(title.to_string());
                }
            }
            "progressBar" => self.handle_progress_bar(element),
            "indicator" => {
                if let Some(id) = id {
                    let visible = element.attr("visible") == Some("y");
                    self.set_status(id, visible);
                }
            }
            "dialogData" => self.handle_dialog_data(id, element),
            _ => {}
        }
    }

    fn handle_prompt(&mut self, element: &Element) {
        self.last_prompt = element.plain_text();

        // Learn server clock offset for countdown synchronization
        if let Some(server_time) = element.attr("time").and_then(|t| t.parse::<i64>().ok()) {
            self.server_time_offset = server_time - chrono::Utc::now().timestamp();
        }
    }

    /// value is the server timestamp when the timer ends
    fn local_end_time(&self, element: &Element) -> Option<i64> {
        element
            .attr("value")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|server_end| server_end - self.server_time_offset)
    }

    // <progressBar id='health' value='100' text='health 175/175' />
    fn handle_progress_bar(&mut self, element: &Element) {
        let Some(id) = element.attr("id") else {
            return;
        };
        let Some(vital) = self.vitals.get_mut(id) else {
            return;
        };

        let percent = element
            .attr("value")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            .min(100);
        let (current, max) = element
            .attr("text")
            .and_then(parse_fraction)
            .unwrap_or((percent, 100));

        *vital = Vital {
            percent: percent as u8,
            current,
            max,
        };
    }

    // <dialogData id='IconSTUNNED' value='active'/>
    // <dialogData id='minivitals'><progressBar id='mana' .../></dialogData>
    fn handle_dialog_data(&mut self, id: Option<&str>, element: &Element) {
        if let Some(icon) = id.filter(|id| id.starts_with("Icon")) {
            if let Some(value) = element.attr("value") {
                self.set_status(icon, value == "active");
            }
        }
        for child in element.children() {
            if child.name() == "progressBar" {
                self.handle_progress_bar(child);
            }
        }
    }

    fn set_status(&mut self, icon: &str, active: bool) {
        match self.status.flag_mut(icon) {
            Some(flag) => *flag = active,
            None => tracing::trace!("Ignoring unknown status icon '{}'", icon),
        }
    }

    /// Seconds of roundtime left at local time `now`
    pub fn roundtime_remaining(&self, now: i64) -> i64 {
        self.roundtime_end.map(|end| (end - now).max(0)).unwrap_or(0)
    }

    /// Seconds of casttime left at local time `now`
    pub fn casttime_remaining(&self, now: i64) -> i64 {
        self.casttime_end.map(|end| (end - now).max(0)).unwrap_or(0)
    }

    /// Check if currently in roundtime
    pub fn in_roundtime(&self) -> bool {
        self.roundtime_remaining(chrono::Utc::now().timestamp()) > 0
    }

    /// Check if currently in casttime
    pub fn in_casttime(&self) -> bool {
        self.casttime_remaining(chrono::Utc::now().timestamp()) > 0
    }
}

impl Default for GameState {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(text: String) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extract current/max from progress text ("mana 407/407" or "175/175")
fn parse_fraction(text: &str) -> Option<(u32, u32)> {
    let (before, after) = text.rsplit_once('/')?;
    let current = before
        .split_whitespace()
        .next_back()?
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    let max = after
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    Some((current, max))
}
