// src/pipeline/event_bus.rs
//
// Decoupled event system. Subsystems publish events instead of
// reaching into each other's state.

use crate::inference::InferenceResponse;
use crate::types::Track;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A track proved stable and entered the scene
    ObjectEntered(Track),

    /// A confirmed track left (per the configured exit policy)
    ObjectExited(Track),

    /// The inference backend described a frame
    DescriptionReady(InferenceResponse),

    /// The detector failed on a frame; Tier-1 continues
    DetectorDegraded { frame_num: u64, reason: String },
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_bus_drops_oldest() {
        let mut bus = EventBus::new(2);
        bus.publish(PipelineEvent::DetectorDegraded {
            frame_num: 1,
            reason: "a".to_string(),
        });
        bus.publish(PipelineEvent::DetectorDegraded {
            frame_num: 2,
            reason: "b".to_string(),
        });
        bus.publish(PipelineEvent::DetectorDegraded {
            frame_num: 3,
            reason: "c".to_string(),
        });

        let drained = bus.drain();
        assert_eq!(drained.len(), 2);
        match &drained[0] {
            PipelineEvent::DetectorDegraded { frame_num, .. } => assert_eq!(*frame_num, 2),
            _ => panic!("unexpected event"),
        }
        assert_eq!(bus.pending_count(), 0);
    }
}
