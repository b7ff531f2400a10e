//! Ingestion pipeline
//!
//! Owns the parser and router and applies each routed batch to the buffers
//! and the event bus. One `MessageProcessor` per session; chunks must be fed
//! in arrival order, which `run` guarantees by draining a single channel.

use crate::config::Config;
use crate::core::event_bus::{Publication, PublishSender};
use crate::core::router::{RouteAction, RoutePlan, RouterSettings, StreamRouter};
use crate::data::{BufferManager, Element};
use crate::network::ServerMessage;
use crate::parser::StreamParser;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Running counters for one processor
#[derive(Clone, Debug, Default, Serialize)]
pub struct IngestStats {
    pub bytes_received: u64,
    pub chunks: u64,
    pub elements_parsed: u64,
    pub publications: u64,
    pub appends: u64,
    pub clears: u64,
    pub duplicates_dropped: u64,
    pub parse_errors: u64,
    pub connections: u64,
    /// Total time spent inside parse calls
    #[serde(with = "duration_micros")]
    pub parse_time: Duration,
}

mod duration_micros {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }
}

/// Processes incoming game chunks: parse, route, then publish and append
pub struct MessageProcessor {
    parser: StreamParser,
    router: StreamRouter,
    buffers: Arc<BufferManager>,
    /// Hands publications to the bus dispatcher without waiting on handlers
    publisher: PublishSender,
    stats: IngestStats,
}

impl MessageProcessor {
    pub fn new(config: &Config, buffers: Arc<BufferManager>, publisher: PublishSender) -> Self {
        Self {
            parser: StreamParser::new(),
            router: StreamRouter::new(RouterSettings::from_config(config)),
            buffers,
            publisher,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    /// Feed one network chunk through the pipeline
    pub fn process_chunk(&mut self, chunk: &str) -> RoutePlan {
        self.process_chunk_at(chunk, Instant::now())
    }

    pub fn process_chunk_at(&mut self, chunk: &str, now: Instant) -> RoutePlan {
        self.stats.bytes_received += chunk.len() as u64;
        self.stats.chunks += 1;

        let parse_start = Instant::now();
        let elements = self.parser.parse(chunk);
        self.stats.parse_time += parse_start.elapsed();
        self.stats.parse_errors = self.parser.error_count();

        self.dispatch(elements, now)
    }

    /// Push out trailing text still held by the parser (end of a replay,
    /// or before a disconnect reset)
    pub fn flush(&mut self) -> RoutePlan {
        let elements = self.parser.flush();
        self.dispatch(elements, Instant::now())
    }

    /// Forget per-connection parser state. Buffers (scrollback) are kept.
    pub fn reset_connection(&mut self) {
        self.parser.reset();
        tracing::debug!("Parser state reset for new connection");
    }

    pub fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Connected => {
                tracing::info!("Connected to server");
                self.stats.connections += 1;
                self.reset_connection();
            }
            ServerMessage::Disconnected => {
                tracing::info!("Disconnected from server");
                self.flush();
                self.reset_connection();
            }
            ServerMessage::Text(chunk) => {
                self.process_chunk(&chunk);
            }
        }
    }

    /// Drain server messages until the channel closes, then return the
    /// final counters
    pub async fn run(mut self, mut server_rx: mpsc::UnboundedReceiver<ServerMessage>) -> IngestStats {
        while let Some(msg) = server_rx.recv().await {
            self.handle_server_message(msg);
        }
        self.flush();
        tracing::info!(
            "Ingestion finished: {} chunks, {} elements, {} parse errors",
            self.stats.chunks,
            self.stats.elements_parsed,
            self.stats.parse_errors
        );
        self.stats
    }

    fn dispatch(&mut self, elements: Vec<Element>, now: Instant) -> RoutePlan {
        if elements.is_empty() {
            return RoutePlan::default();
        }
        self.stats.elements_parsed += elements.len() as u64;

        let plan = self.router.route_at(elements, now);
        self.stats.duplicates_dropped = self.router.duplicates_dropped();
        self.apply(&plan);
        plan
    }

    /// Apply a routed batch in order
    pub fn apply(&mut self, plan: &RoutePlan) {
        for action in &plan.actions {
            match action {
                RouteAction::Publish { topic, payload } => {
                    self.stats.publications += 1;
                    let publication = Publication {
                        topic: topic.clone(),
                        payload: Arc::clone(payload),
                    };
                    if self.publisher.send(publication).is_err() {
                        tracing::warn!("Event dispatcher is gone, dropping '{}'", topic);
                    }
                }
                RouteAction::Append { channel, elements } => {
                    for element in elements {
                        self.buffers.append(Arc::clone(element), channel);
                        self.stats.appends += 1;
                    }
                }
                RouteAction::Clear { channel } => {
                    self.stats.clears += 1;
                    self.buffers.clear(channel);
                }
            }
        }
    }
}
