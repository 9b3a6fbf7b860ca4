//! Live progress rendering for the event stream

use threadline_core::{EventStatus, Phase, ProgressEvent};

/// Renders per-source progress lines to stderr. Each source's events
/// arrive phase-monotonic; sources interleave freely.
pub struct ProgressRenderer {
    enabled: bool,
}

impl ProgressRenderer {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn render(&self, event: &ProgressEvent) {
        if !self.enabled {
            return;
        }

        let phase = match event.phase {
            Phase::Classify => "classify",
            Phase::ExpandAndScore => "expand",
            Phase::Synthesize => "synthesize",
            Phase::Validate => "validate",
            Phase::Pipeline => "pipeline",
        };
        let marker = match event.status {
            EventStatus::Started => "..",
            EventStatus::Progress => "..",
            EventStatus::Completed => "ok",
            EventStatus::Failed => "!!",
        };

        eprintln!("[{}] {} {} {}", event.source_id, phase, marker, event.message);
    }
}
