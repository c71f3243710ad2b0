/// Immutable error records and the factory that builds them
///
/// An `ErrorRecord` is created once at the failure site. Any field the
/// caller leaves unset is filled from the kind's row in the defaults table.
use super::classification::{ErrorKind, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay used when a record's policy does not specify one
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// SDK version stamped into every context
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Context information about where and when an error occurred
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    /// Operation name (e.g., "start_tracking", "upload_batch")
    pub operation: String,

    /// Component that raised the error (e.g., "location", "sync")
    pub component: String,

    /// User the operation ran for, if known
    pub user_id: Option<String>,

    /// Free-form metadata
    pub metadata: HashMap<String, serde_json::Value>,

    /// Host platform identifier
    pub platform: String,

    /// Version of this crate
    pub sdk_version: String,

    /// When the error occurred
    pub timestamp: DateTime<Utc>,

    /// Wrapped original failure
    #[serde(serialize_with = "serialize_cause")]
    pub cause: Option<Arc<dyn StdError + Send + Sync>>,
}

fn serialize_cause<S>(
    cause: &Option<Arc<dyn StdError + Send + Sync>>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match cause {
        Some(cause) => serializer.serialize_some(&cause.to_string()),
        None => serializer.serialize_none(),
    }
}

impl ErrorContext {
    /// Create a new context stamped with the current time and platform
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            user_id: None,
            metadata: HashMap::new(),
            platform: std::env::consts::OS.to_string(),
            sdk_version: SDK_VERSION.to_string(),
            timestamp: Utc::now(),
            cause: None,
        }
    }

    /// Context for an operation without a specific component
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self::new(operation, "unknown")
    }

    /// Set the user id
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Add metadata to the context
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach the original failure
    pub fn with_cause(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    fn restamp(&mut self) {
        self.timestamp = Utc::now();
        self.platform = std::env::consts::OS.to_string();
        self.sdk_version = SDK_VERSION.to_string();
    }
}

/// How a failure may be recovered from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub can_retry: bool,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
    pub user_action: Option<String>,
}

/// Ready-to-render message for presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Classified, immutable description of a failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub context: ErrorContext,
    pub recovery: RecoveryPolicy,
    pub user_message: UserMessage,
}

impl ErrorRecord {
    /// Start building a record of the given kind
    pub fn builder(kind: ErrorKind) -> ErrorRecordBuilder {
        ErrorRecordBuilder::new(kind)
    }

    /// Record with all defaults and the given technical message
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::builder(kind).message(message).build()
    }

    /// Record with all defaults, including the message
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::builder(kind).build()
    }

    /// Per-attempt timeout
    pub fn timeout(operation: &str, after: Duration) -> Self {
        Self::builder(ErrorKind::OperationTimeout)
            .message(format!(
                "Operation '{}' timed out after {}",
                operation,
                humantime::format_duration(after)
            ))
            .context(
                ErrorContext::for_operation(operation)
                    .with_metadata("timeout_ms", after.as_millis() as u64),
            )
            .build()
    }

    /// Fail-fast result of an open or saturated circuit
    pub fn service_unavailable(resource_key: &str, detail: impl Into<String>) -> Self {
        Self::builder(ErrorKind::ServiceUnavailable)
            .message(detail)
            .context(
                ErrorContext::new("circuit_breaker", "retry")
                    .with_metadata("resource_key", resource_key),
            )
            .build()
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkUnavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn storage_corrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageCorrupted, message)
    }

    /// Whether the recovery policy allows retrying
    pub fn is_retryable(&self) -> bool {
        self.recovery.can_retry
    }

    /// Policy delay, or `DEFAULT_RETRY_DELAY` when unset
    pub fn retry_delay(&self) -> Duration {
        self.recovery.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY)
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Copy of this record with extra metadata
    ///
    /// Records are never mutated in place. This produces a new value.
    pub fn with_metadata(
        &self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        let mut record = self.clone();
        record.context.metadata.insert(key.into(), value.into());
        record
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) in {}: {}",
            self.kind, self.severity, self.context.operation, self.message
        )
    }
}

impl StdError for ErrorRecord {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.context
            .cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Factory for `ErrorRecord`; unset fields come from the kind's defaults
#[derive(Debug, Clone)]
pub struct ErrorRecordBuilder {
    kind: ErrorKind,
    message: Option<String>,
    severity: Option<Severity>,
    recovery: Option<RecoveryPolicy>,
    can_retry: Option<bool>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    user_message: Option<UserMessage>,
    context: Option<ErrorContext>,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ErrorRecordBuilder {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            severity: None,
            recovery: None,
            can_retry: None,
            max_retries: None,
            retry_delay: None,
            user_message: None,
            context: None,
            cause: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Replace the whole recovery policy
    pub fn recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = Some(policy);
        self
    }

    pub fn can_retry(mut self, can_retry: bool) -> Self {
        self.can_retry = Some(can_retry);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn user_message(mut self, message: UserMessage) -> Self {
        self.user_message = Some(message);
        self
    }

    pub fn context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn cause(mut self, cause: Arc<dyn StdError + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn build(self) -> ErrorRecord {
        let defaults = self.kind.defaults();

        let mut recovery = self
            .recovery
            .unwrap_or_else(|| self.kind.default_recovery_policy());
        if let Some(can_retry) = self.can_retry {
            recovery.can_retry = can_retry;
        }
        if let Some(max_retries) = self.max_retries {
            recovery.max_retries = max_retries;
        }
        if let Some(delay) = self.retry_delay {
            recovery.retry_delay = Some(delay);
        }

        let mut context = self
            .context
            .unwrap_or_else(|| ErrorContext::for_operation("unknown"));
        context.restamp();
        if let Some(cause) = self.cause {
            context.cause = Some(cause);
        }

        ErrorRecord {
            kind: self.kind,
            severity: self.severity.unwrap_or(defaults.severity),
            message: self
                .message
                .unwrap_or_else(|| defaults.message.to_string()),
            context,
            recovery,
            user_message: self
                .user_message
                .unwrap_or_else(|| self.kind.default_user_message()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_unset_fields() {
        for kind in ErrorKind::ALL {
            let record = ErrorRecord::from_kind(kind);
            assert_eq!(record.severity, kind.default_severity());
            assert_eq!(record.recovery, kind.default_recovery_policy());
            assert_eq!(record.user_message, kind.default_user_message());
            assert_eq!(record.is_retryable(), record.recovery.can_retry);
        }
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let custom = UserMessage {
            title: "Custom".to_string(),
            message: "Custom body".to_string(),
            action: None,
        };
        let record = ErrorRecord::builder(ErrorKind::PermissionDenied)
            .severity(Severity::Low)
            .can_retry(true)
            .max_retries(7)
            .retry_delay(Duration::from_millis(250))
            .user_message(custom.clone())
            .build();

        assert_eq!(record.severity, Severity::Low);
        assert!(record.is_retryable());
        assert_eq!(record.recovery.max_retries, 7);
        assert_eq!(record.retry_delay(), Duration::from_millis(250));
        assert_eq!(record.user_message, custom);
        // Not overridden
        assert_eq!(record.recovery.user_action.as_deref(), Some("Open Settings"));
    }

    #[test]
    fn test_context_is_stamped() {
        let before = Utc::now();
        let record = ErrorRecord::new(ErrorKind::Unknown, "boom");

        assert!(record.context.timestamp >= before);
        assert_eq!(record.context.platform, std::env::consts::OS);
        assert_eq!(record.context.sdk_version, SDK_VERSION);
    }

    #[test]
    fn test_retry_delay_fallback() {
        let record = ErrorRecord::from_kind(ErrorKind::PermissionDenied);
        assert_eq!(record.recovery.retry_delay, None);
        assert_eq!(record.retry_delay(), DEFAULT_RETRY_DELAY);
    }

    #[test]
    fn test_is_critical() {
        assert!(ErrorRecord::storage_corrupted("bad page").is_critical());
        assert!(!ErrorRecord::network("offline").is_critical());
    }

    #[test]
    fn test_timeout_constructor() {
        let record = ErrorRecord::timeout("fetch_fix", Duration::from_secs(60));
        assert_eq!(record.kind, ErrorKind::OperationTimeout);
        assert!(record.message.contains("1m"));
        assert_eq!(record.context.operation, "fetch_fix");
        assert_eq!(record.context.metadata["timeout_ms"], 60_000);
    }

    #[test]
    fn test_context_builder() {
        let ctx = ErrorContext::new("upload", "sync")
            .with_user("user-1")
            .with_metadata("batch", 12);

        assert_eq!(ctx.operation, "upload");
        assert_eq!(ctx.component, "sync");
        assert_eq!(ctx.user_id.as_deref(), Some("user-1"));
        assert_eq!(ctx.metadata.get("batch"), Some(&serde_json::json!(12)));
    }

    #[test]
    fn test_with_metadata_leaves_original_untouched() {
        let record = ErrorRecord::network("offline");
        let tagged = record.with_metadata("attempts", 3);

        assert!(record.context.metadata.is_empty());
        assert_eq!(tagged.context.metadata["attempts"], 3);
    }

    #[test]
    fn test_serializes_cause_as_text() {
        let cause: Arc<dyn StdError + Send + Sync> =
            Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let record = ErrorRecord::builder(ErrorKind::StorageInitFailed)
            .cause(cause)
            .build();

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "STORAGE_INIT_FAILED");
        assert_eq!(json["context"]["cause"], "disk gone");
    }
}
