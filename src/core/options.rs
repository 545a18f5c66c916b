//! Pass configuration.

/// Naming used for generated derivative artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscribeOptions {
    /// Prefix for name hints propagated to differential values.
    pub diff_name_prefix: String,
    /// Prefix for the name hint of generated derivative functions.
    pub func_name_prefix: String,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            diff_name_prefix: "s_diff_".to_string(),
            func_name_prefix: "s_fwd_".to_string(),
        }
    }
}
