//! Coordination-store key layout.
//!
//! Every key the pipeline touches is produced here so the layout cannot
//! drift between components.

/// Stream of pending run submissions.
pub const REQUEST_STREAM: &str = "pipeline:requests";

/// Consumer group reading [`REQUEST_STREAM`].
pub const WORKER_GROUP: &str = "pipeline_workers";

/// Set of registered model keys.
pub const MODEL_KEYS: &str = "model:config:_keys";

/// Mutex holder token for a subject. String, TTL 30 min, refreshable.
pub fn lock(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:lock")
}

/// Cancellation request flag for a subject. String, TTL 5 min.
pub fn cancel(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:cancel")
}

/// Live run status hash for a subject. Deleted on archive.
pub fn active(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:active")
}

/// Archived run snapshot hash. TTL 24 h.
pub fn run(run_id: &str) -> String {
    format!("pipeline:run:{run_id}")
}

/// Per-subject history index: run_ids scored by completion epoch ms.
pub fn history(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:history")
}

/// Model descriptor hash.
pub fn model_config(model_key: &str) -> String {
    format!("model:config:{model_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_fixed_layout() {
        assert_eq!(lock("abc"), "pipeline:abc:lock");
        assert_eq!(cancel("abc"), "pipeline:abc:cancel");
        assert_eq!(active("abc"), "pipeline:abc:active");
        assert_eq!(run("r-1"), "pipeline:run:r-1");
        assert_eq!(history("abc"), "pipeline:abc:history");
        assert_eq!(model_config("vl"), "model:config:vl");
    }
}
