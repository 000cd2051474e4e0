//! Logging utilities with request-scoped context.
//!
//! Hot-path logs carry a correlation id without threading it through every
//! call. The id lives in task-local storage, set once per request by the
//! front-end.

tokio::task_local! {
    /// Task-local storage for the current correlation id.
    pub static CORRELATION_ID: String;
}

/// Get the current correlation id from context, if set.
///
/// Returns an empty string outside a request task.
pub fn correlation_id() -> String {
    CORRELATION_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new correlation id using UUID v4.
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Privacy posture selected by the `-p` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyMode {
    /// Request and response bodies are never logged.
    Strict,
    /// Bodies may appear in debug logs.
    Relaxed,
}

impl PrivacyMode {
    pub fn allows_body_logging(self) -> bool {
        matches!(self, PrivacyMode::Relaxed)
    }
}

impl std::str::FromStr for PrivacyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(PrivacyMode::Strict),
            "relaxed" => Ok(PrivacyMode::Relaxed),
            other => Err(format!("unknown privacy mode: {}", other)),
        }
    }
}

/// Run `fut` with the given correlation id installed in task-local scope.
#[macro_export]
macro_rules! with_correlation_id {
    ($id:expr, $fut:expr) => {
        $crate::core::logging::CORRELATION_ID.scope($id, $fut)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_correlation_id_unique() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_correlation_id_outside_task_scope() {
        assert_eq!(correlation_id(), "");
    }

    #[tokio::test]
    async fn test_correlation_id_in_scope() {
        let id = generate_correlation_id();
        let seen = CORRELATION_ID
            .scope(id.clone(), async { correlation_id() })
            .await;
        assert_eq!(seen, id);
    }

    #[test]
    fn test_privacy_mode_parse() {
        assert_eq!("strict".parse::<PrivacyMode>().unwrap(), PrivacyMode::Strict);
        assert_eq!(
            "relaxed".parse::<PrivacyMode>().unwrap(),
            PrivacyMode::Relaxed
        );
        assert!("loose".parse::<PrivacyMode>().is_err());
    }

    #[test]
    fn test_privacy_mode_body_logging() {
        assert!(!PrivacyMode::Strict.allows_body_logging());
        assert!(PrivacyMode::Relaxed.allows_body_logging());
    }
}
