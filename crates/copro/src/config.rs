//! Run-time configuration of the coprocessor subsystem.

/// How context identifiers are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextIdPolicy {
    /// Identifiers are allocated from `min..=max` on first coprocessor use.
    Tracked { min: u32, max: u32 },
    /// The hardware does not tag translations; every context stays at
    /// [`ContextId::NONE`](crate::ContextId::NONE).
    Untracked,
}

impl ContextIdPolicy {
    pub const fn is_tracked(self) -> bool {
        matches!(self, ContextIdPolicy::Tracked { .. })
    }
}

/// How the coprocessor type hint in a fault syndrome is used.
///
/// The hint is reserved-field data whose presence depends on the hardware variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HintPolicy {
    /// Use the hint when it is marked valid, otherwise the type of the attempted request.
    #[default]
    Advisory,
    /// Only the hint identifies the type; faults without one are rejected.
    Trusted,
    /// Never read the hint; always use the type of the attempted request.
    Ignored,
}

/// Configuration shared by every address space and unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoproConfig {
    pub context_ids: ContextIdPolicy,
    pub hint_policy: HintPolicy,
    /// Number of entries each unit's shadow translation cache can hold.
    pub shadow_capacity: usize,
}

impl CoproConfig {
    pub const DEFAULT_SHADOW_CAPACITY: usize = 64;

    pub const fn new() -> Self {
        Self {
            context_ids: ContextIdPolicy::Tracked { min: 1, max: 0xFFFF },
            hint_policy: HintPolicy::Advisory,
            shadow_capacity: Self::DEFAULT_SHADOW_CAPACITY,
        }
    }

    pub const fn with_context_ids(mut self, context_ids: ContextIdPolicy) -> Self {
        self.context_ids = context_ids;
        self
    }

    pub const fn with_hint_policy(mut self, hint_policy: HintPolicy) -> Self {
        self.hint_policy = hint_policy;
        self
    }

    pub const fn with_shadow_capacity(mut self, shadow_capacity: usize) -> Self {
        self.shadow_capacity = shadow_capacity;
        self
    }
}

impl Default for CoproConfig {
    fn default() -> Self {
        Self::new()
    }
}
