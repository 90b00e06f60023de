use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bitrate::BitrateController;
use crate::cancellation::CancellationToken;

struct BallotState {
    registered: Vec<bool>,
    voted: Vec<bool>,
}

/// Joint-termination ballot across pipeline stages.
///
/// A stage opts in by registering, then casts a monotonic vote. The ballot
/// resolves when every registered stage has voted; resolution cancels the
/// pipeline. With `ignore` set, registrations are refused and the ballot
/// never resolves.
pub struct JointBallot {
    ignore: bool,
    state: Mutex<BallotState>,
}

impl JointBallot {
    pub fn new(stages: usize, ignore: bool) -> Self {
        JointBallot {
            ignore,
            state: Mutex::new(BallotState {
                registered: vec![false; stages],
                voted: vec![false; stages],
            }),
        }
    }

    /// Opt a stage in. Returns false when joint termination is disabled.
    pub fn register(&self, stage: usize) -> bool {
        if self.ignore {
            return false;
        }
        self.state.lock().registered[stage] = true;
        true
    }

    pub fn is_registered(&self, stage: usize) -> bool {
        !self.ignore && self.state.lock().registered[stage]
    }

    /// Cast a stage's vote. Returns true when this vote resolves the ballot.
    pub fn vote(&self, stage: usize) -> bool {
        if self.ignore {
            return false;
        }
        let mut state = self.state.lock();
        if !state.registered[stage] || state.voted[stage] {
            return false;
        }
        state.voted[stage] = true;
        state
            .registered
            .iter()
            .zip(&state.voted)
            .all(|(&reg, &vote)| !reg || vote)
    }
}

/// Pipeline-wide facilities shared by every stage.
pub(crate) struct PipelineShared {
    pub name: String,
    pub realtime: bool,
    pub token: CancellationToken,
    pub bitrate: BitrateController,
    pub ballot: JointBallot,
}

/// A stage's view of the pipeline.
///
/// Handed to every plugin callback; gives access to the effective bitrate,
/// the joint-termination ballot and the cancellation flag.
pub struct StageHandle {
    shared: Arc<PipelineShared>,
    stage: usize,
    stage_name: &'static str,
}

impl StageHandle {
    pub(crate) fn new(
        shared: Arc<PipelineShared>,
        stage: usize,
        stage_name: &'static str,
    ) -> Self {
        StageHandle {
            shared,
            stage,
            stage_name,
        }
    }

    /// Name of the plugin running in this stage.
    pub fn stage_name(&self) -> &'static str {
        self.stage_name
    }

    /// Name of the pipeline.
    pub fn pipeline_name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the pipeline runs with realtime defaults.
    pub fn is_realtime(&self) -> bool {
        self.shared.realtime
    }

    /// Current effective TS bitrate in b/s (0 = unknown).
    pub fn bitrate(&self) -> u64 {
        self.shared.bitrate.current()
    }

    /// Force a bitrate re-evaluation and return the new value.
    pub fn refresh_bitrate(&self) -> u64 {
        self.shared.bitrate.refresh()
    }

    /// Opt this stage into joint termination. Returns false when joint
    /// termination is globally disabled.
    pub fn use_joint_termination(&self) -> bool {
        self.shared.ballot.register(self.stage)
    }

    pub fn uses_joint_termination(&self) -> bool {
        self.shared.ballot.is_registered(self.stage)
    }

    /// Cast this stage's joint-termination vote. When the last registered
    /// stage votes, the pipeline terminates.
    pub fn joint_terminate(&self) {
        debug!(stage = self.stage_name, "joint termination vote");
        if self.shared.ballot.vote(self.stage) {
            info!("all stages voted for joint termination, terminating");
            self.shared.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ballot_resolves_when_all_voted() {
        let ballot = JointBallot::new(3, false);
        assert!(ballot.register(0));
        assert!(ballot.register(2));
        assert!(!ballot.vote(0));
        // Unregistered stage votes are ignored
        assert!(!ballot.vote(1));
        assert!(ballot.vote(2));
    }

    #[test]
    fn test_ballot_vote_is_monotonic() {
        let ballot = JointBallot::new(2, false);
        ballot.register(0);
        ballot.register(1);
        assert!(!ballot.vote(0));
        assert!(!ballot.vote(0));
        assert!(ballot.vote(1));
    }

    #[test]
    fn test_ignored_ballot_never_resolves() {
        let ballot = JointBallot::new(1, true);
        assert!(!ballot.register(0));
        assert!(!ballot.vote(0));
    }
}
