//! Stream routing - decides where every parsed element goes
//!
//! Metadata tags become publications, dedicated stream wrappers are unwrapped
//! into their channel's buffer, clearStream directives clear a buffer, and
//! everything else lands in main. Identical text sent to the same channel
//! within a short window is dropped (the server repeats some lines through
//! more than one stream).

use crate::config::Config;
use crate::data::{Element, MAIN_CHANNEL};
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Routing policy, built from `Config`
#[derive(Clone, Debug)]
pub struct RouterSettings {
    pub metadata: HashSet<String>,
    /// Channels with their own buffer (the exclusion set)
    pub dedicated: HashSet<String>,
    /// Channels recognized but passed through to main
    pub known: HashSet<String>,
    pub mirror: bool,
    pub dedup_window: Duration,
    pub dedup_history: usize,
    /// (compiled pattern, event type)
    pub event_patterns: Vec<(Regex, String)>,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut event_patterns = Vec::new();
        for (name, pattern) in &config.event_patterns {
            if !pattern.enabled {
                continue;
            }
            match Regex::new(&pattern.pattern) {
                Ok(regex) => event_patterns.push((regex, pattern.event_type.clone())),
                Err(e) => tracing::warn!("Invalid event pattern '{}': {}", name, e),
            }
        }

        Self {
            metadata: config.metadata.names.iter().cloned().collect(),
            dedicated: config.streams.dedicated.iter().cloned().collect(),
            known: config.streams.known.iter().cloned().collect(),
            mirror: config.streams.mirror,
            dedup_window: Duration::from_millis(config.streams.dedup_window_ms),
            dedup_history: config.streams.dedup_history.max(1),
            event_patterns,
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Where a single top-level element goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Publish on this topic; never buffered
    Metadata(String),
    /// Unwrap into the dedicated channel's buffer
    Channel(String),
    /// Unwrap into the dedicated channel and copy into main
    Mirrored(String),
    /// Clear this channel's buffer (clearStream)
    Clear(String),
    /// Default buffer, unchanged
    Main,
}

/// One classified element
#[derive(Debug)]
pub enum Classified {
    Metadata { topic: String, element: Element },
    Content(Element),
}

/// Result of `classify`: metadata split from content, document order kept
#[derive(Debug, Default)]
pub struct Classification {
    /// Topics that received a publication
    pub metadata_ids: BTreeSet<String>,
    pub items: Vec<Classified>,
}

/// One step of applying a routed batch, in document order
#[derive(Clone, Debug)]
pub enum RouteAction {
    Publish { topic: String, payload: Arc<Element> },
    Append { channel: String, elements: Vec<Arc<Element>> },
    Clear { channel: String },
}

#[derive(Clone, Debug, Default)]
pub struct RoutePlan {
    pub actions: Vec<RouteAction>,
}

impl RoutePlan {
    fn publish(&mut self, topic: String, payload: Arc<Element>) {
        self.actions.push(RouteAction::Publish { topic, payload });
    }

    /// Topics published by this plan, in order
    pub fn topics(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                RouteAction::Publish { topic, .. } => Some(topic.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Elements appended to `channel` by this plan, in order
    pub fn appended_to(&self, channel: &str) -> Vec<&Element> {
        self.actions
            .iter()
            .filter_map(|a| match a {
                RouteAction::Append { channel: c, elements } if c == channel => Some(elements),
                _ => None,
            })
            .flatten()
            .map(|e| e.as_ref())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Recently stored text for one channel
#[derive(Debug, Default)]
struct DedupHistory {
    entries: VecDeque<(String, Instant)>,
}

#[derive(Debug)]
pub struct StreamRouter {
    settings: RouterSettings,
    history: HashMap<String, DedupHistory>,
    /// Unknown stream ids already reported
    warned_streams: HashSet<String>,
    duplicates_dropped: u64,
}

impl StreamRouter {
    pub fn new(settings: RouterSettings) -> Self {
        Self {
            settings,
            history: HashMap::new(),
            warned_streams: HashSet::new(),
            duplicates_dropped: 0,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    /// Topic for a metadata element, or None if it is content
    pub fn metadata_topic(&self, element: &Element) -> Option<String> {
        if !self.settings.metadata.contains(element.name()) {
            return None;
        }
        Some(match element.attr("id") {
            Some(id) if !id.is_empty() => format!("metadata/{}/{}", element.name(), id),
            _ => format!("metadata/{}", element.name()),
        })
    }

    /// Split a batch into metadata publications and content
    pub fn classify(&self, elements: Vec<Element>) -> Classification {
        let mut classification = Classification::default();
        for element in elements {
            let item = match self.metadata_topic(&element) {
                Some(topic) => {
                    classification.metadata_ids.insert(topic.clone());
                    Classified::Metadata { topic, element }
                }
                None => Classified::Content(element),
            };
            classification.items.push(item);
        }
        classification
    }

    /// Destination for one top-level element
    pub fn route_stream(&mut self, element: &Element) -> Destination {
        if let Some(topic) = self.metadata_topic(element) {
            return Destination::Metadata(topic);
        }

        if element.name() == "clearStream" {
            if let Some(id) = element.attr("id") {
                return Destination::Clear(id.to_string());
            }
        }

        if !element.is_stream_wrapper() {
            return Destination::Main;
        }

        let id = element.attr("id").unwrap_or_default();
        if self.settings.dedicated.contains(id) {
            if self.settings.mirror {
                Destination::Mirrored(id.to_string())
            } else {
                Destination::Channel(id.to_string())
            }
        } else {
            if id != MAIN_CHANNEL
                && !self.settings.known.contains(id)
                && self.warned_streams.insert(id.to_string())
            {
                tracing::warn!("Unknown stream '{}', routing its content to main", id);
            }
            Destination::Main
        }
    }

    /// Route one parse batch at the current time
    pub fn route(&mut self, elements: Vec<Element>) -> RoutePlan {
        self.route_at(elements, Instant::now())
    }

    /// Route one parse batch. Each contiguous run of main content and each
    /// unwrapped stream is a separate batch for deduplication.
    pub fn route_at(&mut self, elements: Vec<Element>, now: Instant) -> RoutePlan {
        let mut plan = RoutePlan::default();
        let mut main_run: Vec<Arc<Element>> = Vec::new();

        let classification = self.classify(elements);
        if !classification.metadata_ids.is_empty() {
            tracing::trace!("Batch carries metadata {:?}", classification.metadata_ids);
        }

        for item in classification.items {
            let element = match item {
                Classified::Metadata { topic, element } => {
                    self.commit(MAIN_CHANNEL, std::mem::take(&mut main_run), now, true, &mut plan);
                    plan.publish(topic, Arc::new(element));
                    continue;
                }
                Classified::Content(element) => element,
            };

            match self.route_stream(&element) {
                Destination::Main => main_run.push(Arc::new(element)),
                Destination::Metadata(topic) => {
                    self.commit(MAIN_CHANNEL, std::mem::take(&mut main_run), now, true, &mut plan);
                    plan.publish(topic, Arc::new(element));
                }
                Destination::Clear(channel) => {
                    self.commit(MAIN_CHANNEL, std::mem::take(&mut main_run), now, true, &mut plan);
                    // Content after a clear is new even if it repeats
                    self.history.remove(&channel);
                    plan.actions.push(RouteAction::Clear { channel });
                }
                Destination::Channel(channel) | Destination::Mirrored(channel) => {
                    let mirror = self.settings.mirror;
                    self.commit(MAIN_CHANNEL, std::mem::take(&mut main_run), now, true, &mut plan);

                    let mut children = Vec::new();
                    for child in self.classify(element.into_children()).items {
                        match child {
                            Classified::Metadata { topic, element } => {
                                plan.publish(topic, Arc::new(element))
                            }
                            Classified::Content(element) => children.push(Arc::new(element)),
                        }
                    }

                    if mirror {
                        self.commit(&channel, children.clone(), now, true, &mut plan);
                        self.commit(MAIN_CHANNEL, children, now, false, &mut plan);
                    } else {
                        self.commit(&channel, children, now, true, &mut plan);
                    }
                }
            }
        }

        self.commit(MAIN_CHANNEL, main_run, now, true, &mut plan);
        plan
    }

    /// Append a content batch unless it is a duplicate. Event patterns are
    /// matched only against content that is actually stored.
    fn commit(
        &mut self,
        channel: &str,
        elements: Vec<Arc<Element>>,
        now: Instant,
        fire_events: bool,
        plan: &mut RoutePlan,
    ) {
        if elements.is_empty() {
            return;
        }
        if self.is_duplicate_at(channel, &elements, now) {
            self.duplicates_dropped += 1;
            tracing::debug!(
                "Dropping duplicate batch of {} element(s) on '{}'",
                elements.len(),
                channel
            );
            return;
        }

        let events = if fire_events {
            self.match_events(&elements)
        } else {
            Vec::new()
        };
        plan.actions.push(RouteAction::Append {
            channel: channel.to_string(),
            elements,
        });
        plan.actions.extend(events);
    }

    /// Check a content batch against recent history for `channel`,
    /// remembering it if it is new
    pub fn is_duplicate(&mut self, channel: &str, elements: &[Arc<Element>]) -> bool {
        self.is_duplicate_at(channel, elements, Instant::now())
    }

    pub fn is_duplicate_at(&mut self, channel: &str, elements: &[Arc<Element>], now: Instant) -> bool {
        let text: String = elements.iter().map(|e| e.plain_text()).collect();
        // Blank lines repeat legitimately
        if text.trim().is_empty() {
            return false;
        }

        let window = self.settings.dedup_window;
        let limit = self.settings.dedup_history;
        let history = self.history.entry(channel.to_string()).or_default();

        history
            .entries
            .retain(|(_, at)| now.saturating_duration_since(*at) <= window);

        if history.entries.iter().any(|(seen, _)| *seen == text) {
            return true;
        }

        history.entries.push_back((text, now));
        while history.entries.len() > limit {
            history.entries.pop_front();
        }
        false
    }

    fn match_events(&self, elements: &[Arc<Element>]) -> Vec<RouteAction> {
        let mut events = Vec::new();
        if self.settings.event_patterns.is_empty() {
            return events;
        }
        for element in elements {
            let text = element.plain_text();
            for (regex, event_type) in &self.settings.event_patterns {
                if regex.is_match(&text) {
                    tracing::debug!("Event pattern '{}' matched: {:?}", event_type, text);
                    events.push(RouteAction::Publish {
                        topic: format!("event/{}", event_type),
                        payload: Arc::clone(element),
                    });
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::element::TEXT_NAME;
    use crate::parser::StreamParser;

    fn router() -> StreamRouter {
        StreamRouter::new(RouterSettings::default())
    }

    fn parse(markup: &str) -> Vec<Element> {
        let mut parser = StreamParser::new();
        parser.parse(markup)
    }

    fn texts(elements: &[&Element]) -> Vec<String> {
        elements.iter().map(|e| e.plain_text()).collect()
    }

    #[test]
    fn test_metadata_goes_to_bus_only() {
        let mut router = router();
        let plan = router.route(parse("<left>a sword</left>"));

        assert_eq!(plan.topics(), vec!["metadata/left"]);
        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0] {
            RouteAction::Publish { payload, .. } => assert_eq!(payload.plain_text(), "a sword"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_parametric_metadata_topic() {
        let mut router = router();
        let plan = router.route(parse(
            "<progressBar id='health' value='100' text='health 175/175'/><prompt time='1'>&gt;</prompt>",
        ));
        assert_eq!(
            plan.topics(),
            vec!["metadata/progressBar/health", "metadata/prompt"]
        );
    }

    #[test]
    fn test_classify_splits_metadata_and_content() {
        let router = router();
        let classification =
            router.classify(parse("You see a gate.<right>a shield</right><b>x</b>"));

        assert_eq!(
            classification.metadata_ids.iter().collect::<Vec<_>>(),
            vec!["metadata/right"]
        );
        let order: Vec<String> = classification
            .items
            .iter()
            .map(|item| match item {
                Classified::Metadata { topic, .. } => topic.clone(),
                Classified::Content(element) => element.name().to_string(),
            })
            .collect();
        assert_eq!(order, vec![TEXT_NAME, "metadata/right", "b"]);
    }

    #[test]
    fn test_dedicated_stream_is_unwrapped() {
        let mut router = router();
        let plan = router.route(parse(
            "<pushStream id='thoughts'/>[General] hi<popStream/>You nod.<prompt time='1'>&gt;</prompt>",
        ));

        let thoughts = plan.appended_to("thoughts");
        assert_eq!(texts(&thoughts), vec!["[General] hi"]);
        assert!(thoughts.iter().all(|e| !e.is_stream_wrapper()));
        assert_eq!(texts(&plan.appended_to(MAIN_CHANNEL)), vec!["You nod."]);
    }

    #[test]
    fn test_mirror_copies_into_main() {
        let mut settings = RouterSettings::default();
        settings.mirror = true;
        let mut router = StreamRouter::new(settings);

        let wrapper = parse("<pushStream id='speech'/>You say, \"Hi.\"<popStream/>");
        assert!(matches!(
            router.route_stream(&wrapper[0]),
            Destination::Mirrored(ref c) if c == "speech"
        ));

        let plan = router.route(wrapper);
        assert_eq!(texts(&plan.appended_to("speech")), vec!["You say, \"Hi.\""]);
        assert_eq!(texts(&plan.appended_to(MAIN_CHANNEL)), vec!["You say, \"Hi.\""]);
    }

    #[test]
    fn test_unknown_stream_passes_through_unchanged() {
        let mut router = router();
        let plan = router.route(parse("<pushStream id='mystery'/>boo<popStream/>"));

        let main = plan.appended_to(MAIN_CHANNEL);
        assert_eq!(main.len(), 1);
        assert!(main[0].is_stream_wrapper());
        assert_eq!(main[0].plain_text(), "boo");
        assert!(plan.appended_to("mystery").is_empty());

        // Logged once, still routed every time
        router.route(parse("<pushStream id='mystery'/>again<popStream/>"));
        assert_eq!(router.warned_streams.len(), 1);
    }

    #[test]
    fn test_clear_stream_resets_history() {
        let mut router = router();
        let now = Instant::now();
        let room = "<pushStream id='room'/>[Town Square]<popStream/>";

        let first = router.route_at(parse(room), now);
        assert_eq!(first.appended_to("room").len(), 1);

        let cleared = router.route_at(
            parse(&format!("<clearStream id='room'/>{}", room)),
            now + Duration::from_millis(10),
        );
        assert!(matches!(
            cleared.actions[0],
            RouteAction::Clear { ref channel } if channel == "room"
        ));
        assert_eq!(cleared.appended_to("room").len(), 1);
    }

    #[test]
    fn test_duplicate_within_window_is_dropped() {
        let mut router = router();
        let now = Instant::now();
        let line = "<pushStream id='speech'/>Hello<popStream/>";

        let first = router.route_at(parse(line), now);
        let second = router.route_at(parse(line), now + Duration::from_millis(50));

        assert_eq!(first.appended_to("speech").len(), 1);
        assert!(second.appended_to("speech").is_empty());
        assert_eq!(router.duplicates_dropped(), 1);
    }

    #[test]
    fn test_duplicate_outside_window_is_kept() {
        let mut router = router();
        let now = Instant::now();
        let line = "<pushStream id='speech'/>Hello<popStream/>";

        router.route_at(parse(line), now);
        let later = router.route_at(parse(line), now + Duration::from_millis(500));
        assert_eq!(later.appended_to("speech").len(), 1);
    }

    #[test]
    fn test_same_text_on_other_channel_is_kept() {
        let mut router = router();
        let now = Instant::now();

        let plan = router.route_at(
            parse("<pushStream id='speech'/>Hello<popStream/>Hello<prompt time='1'>&gt;</prompt>"),
            now,
        );
        assert_eq!(plan.appended_to("speech").len(), 1);
        assert_eq!(plan.appended_to(MAIN_CHANNEL).len(), 1);
    }

    #[test]
    fn test_blank_lines_are_never_duplicates() {
        let mut router = router();
        let blank = vec![Arc::new(Element::text_run("\n", None))];
        assert!(!router.is_duplicate(MAIN_CHANNEL, &blank));
        assert!(!router.is_duplicate(MAIN_CHANNEL, &blank));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut settings = RouterSettings::default();
        settings.dedup_history = 2;
        let mut router = StreamRouter::new(settings);
        let now = Instant::now();
        let batch = |t: &str| vec![Arc::new(Element::text_run(t, None))];

        assert!(!router.is_duplicate_at("main", &batch("a"), now));
        assert!(!router.is_duplicate_at("main", &batch("b"), now));
        assert!(!router.is_duplicate_at("main", &batch("c"), now));
        // "a" was pushed out by the cap
        assert!(!router.is_duplicate_at("main", &batch("a"), now));
        assert!(router.is_duplicate_at("main", &batch("c"), now));
    }

    #[test]
    fn test_metadata_inside_dedicated_stream_is_published() {
        let mut router = router();
        let plan = router.route(parse(
            "<pushStream id='inv'/>Your pack holds:<left>a dagger</left><popStream/>",
        ));

        assert_eq!(plan.topics(), vec!["metadata/left"]);
        assert_eq!(texts(&plan.appended_to("inv")), vec!["Your pack holds:"]);
    }

    #[test]
    fn test_event_patterns_publish() {
        let mut config = Config::default();
        config.event_patterns.insert(
            "stunned".to_string(),
            crate::config::EventPattern {
                pattern: "^You are stunned".to_string(),
                event_type: "stun".to_string(),
                enabled: true,
            },
        );
        let mut router = StreamRouter::new(RouterSettings::from_config(&config));

        let plan = router.route(parse("You are stunned!\n<prompt time='1'>&gt;</prompt>"));
        assert_eq!(plan.topics(), vec!["event/stun", "metadata/prompt"]);
        assert_eq!(texts(&plan.appended_to(MAIN_CHANNEL)), vec!["You are stunned!\n"]);
    }

    #[test]
    fn test_duplicate_line_does_not_fire_event_again() {
        let mut config = Config::default();
        config.event_patterns.insert(
            "stunned".to_string(),
            crate::config::EventPattern {
                pattern: "^You are stunned".to_string(),
                event_type: "stun".to_string(),
                enabled: true,
            },
        );
        let mut router = StreamRouter::new(RouterSettings::from_config(&config));
        let now = Instant::now();
        let line = "<pushStream id='speech'/>You are stunned!<popStream/>";

        let first = router.route_at(parse(line), now);
        assert_eq!(first.topics(), vec!["event/stun"]);
        assert_eq!(first.appended_to("speech").len(), 1);

        let second = router.route_at(parse(line), now + Duration::from_millis(50));
        assert!(second.is_empty());
        assert_eq!(router.duplicates_dropped(), 1);

        // Mirrored content fires once, from its own channel
        let mut settings = RouterSettings::from_config(&config);
        settings.mirror = true;
        let mut router = StreamRouter::new(settings);
        let plan = router.route_at(parse(line), now);
        assert_eq!(plan.topics(), vec!["event/stun"]);
        assert_eq!(plan.appended_to(MAIN_CHANNEL).len(), 1);
    }

    #[test]
    fn test_order_is_preserved_across_destinations() {
        let mut router = router();
        let plan = router.route(parse(
            "one<left>x</left>two<pushStream id='speech'/>three<popStream/>four<prompt time='1'>&gt;</prompt>",
        ));

        let steps: Vec<String> = plan
            .actions
            .iter()
            .map(|a| match a {
                RouteAction::Publish { topic, .. } => topic.clone(),
                RouteAction::Append { channel, elements } => format!(
                    "{}:{}",
                    channel,
                    elements.iter().map(|e| e.plain_text()).collect::<String>()
                ),
                RouteAction::Clear { channel } => format!("clear:{}", channel),
            })
            .collect();
        assert_eq!(
            steps,
            vec![
                "main:one",
                "metadata/left",
                "main:two",
                "speech:three",
                "main:four",
                "metadata/prompt",
            ]
        );
    }
}
