use serde::Serialize;
use std::fmt;

/// Lifecycle state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    New,
    Provisioning,
    PortAllocating,
    Initializing,
    Launching,
    Connecting,
    Serving,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::New => "new",
            InstanceState::Provisioning => "provisioning",
            InstanceState::PortAllocating => "port_allocating",
            InstanceState::Initializing => "initializing",
            InstanceState::Launching => "launching",
            InstanceState::Connecting => "connecting",
            InstanceState::Serving => "serving",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl InstanceState {
    pub const ALL: [InstanceState; 10] = [
        InstanceState::New,
        InstanceState::Provisioning,
        InstanceState::PortAllocating,
        InstanceState::Initializing,
        InstanceState::Launching,
        InstanceState::Connecting,
        InstanceState::Serving,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Failed,
    ];

    /// `Stopped` and `Failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Whether the start pipeline is still running in this state.
    pub fn is_starting(&self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning
                | InstanceState::PortAllocating
                | InstanceState::Initializing
                | InstanceState::Launching
                | InstanceState::Connecting
        )
    }

    /// Check if a state transition is valid according to the state machine.
    ///
    /// ```text
    /// New ─► Provisioning ─► PortAllocating ─► Initializing ─► Launching ─► Connecting ─► Serving
    ///  │          └───────────────┴─────────────────┴───────────────┴────────────┴───────────┤
    ///  │                                   (error) ─► Failed          (stop) ─► Stopping ─► Stopped
    ///  └──────────────────────────────────────────────────────────────────────────────────────► Stopped
    /// ```
    ///
    /// # Examples
    ///
    /// ```
    /// use throwaway_db::instance::InstanceState;
    ///
    /// assert!(InstanceState::New.is_valid_transition(InstanceState::Provisioning));
    /// assert!(InstanceState::New.is_valid_transition(InstanceState::Stopped));
    /// assert!(!InstanceState::New.is_valid_transition(InstanceState::Serving)); // Must run the pipeline
    /// assert!(!InstanceState::Stopped.is_valid_transition(InstanceState::Failed)); // Terminal
    /// ```
    pub fn is_valid_transition(&self, to: InstanceState) -> bool {
        use InstanceState::*;
        match (self, to) {
            // start() or a stop() that never started anything
            (New, Provisioning) => true,
            (New, Stopped) => true,

            // Pipeline steps, strictly in order
            (Provisioning, PortAllocating) => true,
            (PortAllocating, Initializing) => true,
            (Initializing, Launching) => true,
            (Launching, Connecting) => true,
            (Connecting, Serving) => true,

            // Terminal states are entered at most once
            (from, _) if from.is_terminal() => false,

            // Any error before teardown
            (from, Failed) if *from != Stopping => true,

            // stop() once something may have been allocated
            (from, Stopping) if from.is_starting() || *from == Serving => true,

            (Stopping, Stopped) => true,

            _ => false,
        }
    }
}
