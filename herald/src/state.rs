use herald_common::traits::fsm::FiniteStateMachine;

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Uninitialized,
    /// Store is being loaded and stale records purged.
    Initializing,
    /// Store loaded; the queue stays paused until started.
    Ready,
    Running,
    Paused,
    /// The worker has consumed the last backlog task.
    Draining,
    /// The backlog existing at start time has been fully processed.
    Idle,
}

/// Inputs that drive [`ControllerState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateInput {
    Initialize,
    Loaded,
    Start,
    Pause,
    Resume,
    BacklogConsumed,
    Drained,
}

impl FiniteStateMachine for ControllerState {
    type Input = StateInput;
    type Context = ();

    fn transition(self, input: Self::Input, _context: &mut Self::Context) -> Self {
        use ControllerState::{
            Draining, Idle, Initializing, Paused, Ready, Running, Uninitialized,
        };
        use StateInput::{BacklogConsumed, Drained, Initialize, Loaded, Pause, Resume, Start};

        match (self, input) {
            (Uninitialized, Initialize) => Initializing,
            (Initializing, Loaded) => Ready,
            (Ready | Idle, Start) => Running,
            (Running, Pause) => Paused,
            (Paused, Resume) => Running,
            (Running, BacklogConsumed) => Draining,
            (Draining, Drained) => Idle,
            // Anything else is not a meaningful transition; hold the state.
            (state, _) => state,
        }
    }
}
