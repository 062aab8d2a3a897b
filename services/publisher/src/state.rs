//! Publisher states and the checked transition function.

use std::fmt;
use thiserror::Error;

/// Every state the publisher can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherState {
    Initializing,
    ListingRootFolder,
    CreatingAppFolder,
    ListingAppFolder,
    ListingAppFolderContinue,
    Idle,
    PoppingSegment,
    SendingSegment,
    SendingSegmentRetryTimer,
    SendingSegmentRetry,
    TerminatingVideo,
    /// Fatal stop. Nothing leaves this state.
    Failed,
}

impl PublisherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublisherState::Initializing => "initializing",
            PublisherState::ListingRootFolder => "listing_root_folder",
            PublisherState::CreatingAppFolder => "creating_app_folder",
            PublisherState::ListingAppFolder => "listing_app_folder",
            PublisherState::ListingAppFolderContinue => "listing_app_folder_continue",
            PublisherState::Idle => "idle",
            PublisherState::PoppingSegment => "popping_segment",
            PublisherState::SendingSegment => "sending_segment",
            PublisherState::SendingSegmentRetryTimer => "sending_segment_retry_timer",
            PublisherState::SendingSegmentRetry => "sending_segment_retry",
            PublisherState::TerminatingVideo => "terminating_video",
            PublisherState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublisherState::TerminatingVideo | PublisherState::Failed
        )
    }

    /// Whether `self -> next` is an edge of the machine.
    pub fn can_transition_to(&self, next: PublisherState) -> bool {
        use PublisherState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Initializing, ListingRootFolder)
                | (ListingRootFolder, ListingRootFolder)
                | (ListingRootFolder, CreatingAppFolder)
                | (ListingRootFolder, ListingAppFolder)
                | (CreatingAppFolder, ListingAppFolder)
                | (ListingAppFolder, ListingAppFolderContinue)
                | (ListingAppFolder, Idle)
                | (ListingAppFolderContinue, ListingAppFolderContinue)
                | (ListingAppFolderContinue, Idle)
                | (Idle, PoppingSegment)
                | (PoppingSegment, SendingSegment)
                | (PoppingSegment, Idle)
                | (PoppingSegment, TerminatingVideo)
                | (SendingSegment, Idle)
                | (SendingSegment, SendingSegmentRetryTimer)
                | (SendingSegmentRetryTimer, SendingSegmentRetry)
                | (SendingSegmentRetry, Idle)
                | (SendingSegmentRetry, SendingSegmentRetryTimer)
        )
    }
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Expected state {expected} but publisher is in {actual}")]
    UnexpectedState {
        expected: PublisherState,
        actual: PublisherState,
    },

    #[error("Invalid transition {from} -> {to}")]
    InvalidEdge {
        from: PublisherState,
        to: PublisherState,
    },
}

/// The single owner of the current [`PublisherState`].
#[derive(Debug)]
pub struct StateMachine {
    state: PublisherState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: PublisherState::Initializing,
        }
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    /// Move from `expected` to `next`.
    ///
    /// Fails without changing anything if the machine is not in `expected`
    /// or if the edge does not exist.
    pub fn transition(
        &mut self,
        expected: PublisherState,
        next: PublisherState,
    ) -> Result<(), TransitionError> {
        if self.state != expected {
            return Err(TransitionError::UnexpectedState {
                expected,
                actual: self.state,
            });
        }
        if !expected.can_transition_to(next) {
            return Err(TransitionError::InvalidEdge {
                from: expected,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Enter `Failed` from wherever the machine is. Returns the previous
    /// state, or `None` if it was already terminal.
    pub fn fail(&mut self) -> Option<PublisherState> {
        if self.state.is_terminal() {
            return None;
        }
        let previous = self.state;
        self.state = PublisherState::Failed;
        Some(previous)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
