/// Error taxonomy and normalization
///
/// This module defines the closed set of error kinds, their severities, and
/// the per-kind default tables that every `ErrorRecord` is filled from.
/// `ErrorClassifier::normalize` turns anything that failed into an
/// `ErrorRecord`, using best-effort keyword matching for opaque failures.
use super::record::{ErrorContext, ErrorRecord, RecoveryPolicy, UserMessage};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Functional area an error kind belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Permission,
    Location,
    Tracking,
    Geofence,
    Storage,
    Crypto,
    Export,
    Platform,
    Network,
    Configuration,
    Unknown,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorDomain::Permission => "permission",
            ErrorDomain::Location => "location",
            ErrorDomain::Tracking => "tracking",
            ErrorDomain::Geofence => "geofence",
            ErrorDomain::Storage => "storage",
            ErrorDomain::Crypto => "crypto",
            ErrorDomain::Export => "export",
            ErrorDomain::Platform => "platform",
            ErrorDomain::Network => "network",
            ErrorDomain::Configuration => "configuration",
            ErrorDomain::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Categorical identifier for a class of failure
///
/// The serialized form is the stable error code (e.g. `LOCATION_TIMEOUT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    // Permission
    PermissionDenied,
    PermissionBackgroundDenied,
    PermissionRestricted,

    // Location
    LocationUnavailable,
    LocationTimeout,
    LocationAccuracyInsufficient,
    LocationServicesDisabled,

    // Tracking
    TrackingStartFailed,
    TrackingAlreadyActive,
    TrackingNotActive,

    // Geofence
    GeofenceLimitExceeded,
    GeofenceInvalidRegion,
    GeofenceMonitoringFailed,

    // Storage
    StorageQueryFailed,
    StorageCorrupted,
    StorageFull,
    StorageInitFailed,

    // Crypto
    EncryptionFailed,
    DecryptionFailed,
    KeyMissing,

    // Export / audit
    ExportFailed,
    AuditSignatureInvalid,
    AuditChainBroken,

    // Platform
    PlatformUnsupported,
    BackgroundTaskFailed,

    // Network
    NetworkUnavailable,
    NetworkTimeout,
    ServiceUnavailable,

    // Configuration
    ConfigurationInvalid,
    ConfigurationMissing,

    // Generic
    OperationTimeout,
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 32] = [
        ErrorKind::PermissionDenied,
        ErrorKind::PermissionBackgroundDenied,
        ErrorKind::PermissionRestricted,
        ErrorKind::LocationUnavailable,
        ErrorKind::LocationTimeout,
        ErrorKind::LocationAccuracyInsufficient,
        ErrorKind::LocationServicesDisabled,
        ErrorKind::TrackingStartFailed,
        ErrorKind::TrackingAlreadyActive,
        ErrorKind::TrackingNotActive,
        ErrorKind::GeofenceLimitExceeded,
        ErrorKind::GeofenceInvalidRegion,
        ErrorKind::GeofenceMonitoringFailed,
        ErrorKind::StorageQueryFailed,
        ErrorKind::StorageCorrupted,
        ErrorKind::StorageFull,
        ErrorKind::StorageInitFailed,
        ErrorKind::EncryptionFailed,
        ErrorKind::DecryptionFailed,
        ErrorKind::KeyMissing,
        ErrorKind::ExportFailed,
        ErrorKind::AuditSignatureInvalid,
        ErrorKind::AuditChainBroken,
        ErrorKind::PlatformUnsupported,
        ErrorKind::BackgroundTaskFailed,
        ErrorKind::NetworkUnavailable,
        ErrorKind::NetworkTimeout,
        ErrorKind::ServiceUnavailable,
        ErrorKind::ConfigurationInvalid,
        ErrorKind::ConfigurationMissing,
        ErrorKind::OperationTimeout,
        ErrorKind::Unknown,
    ];

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::PermissionBackgroundDenied => "PERMISSION_BACKGROUND_DENIED",
            ErrorKind::PermissionRestricted => "PERMISSION_RESTRICTED",
            ErrorKind::LocationUnavailable => "LOCATION_UNAVAILABLE",
            ErrorKind::LocationTimeout => "LOCATION_TIMEOUT",
            ErrorKind::LocationAccuracyInsufficient => "LOCATION_ACCURACY_INSUFFICIENT",
            ErrorKind::LocationServicesDisabled => "LOCATION_SERVICES_DISABLED",
            ErrorKind::TrackingStartFailed => "TRACKING_START_FAILED",
            ErrorKind::TrackingAlreadyActive => "TRACKING_ALREADY_ACTIVE",
            ErrorKind::TrackingNotActive => "TRACKING_NOT_ACTIVE",
            ErrorKind::GeofenceLimitExceeded => "GEOFENCE_LIMIT_EXCEEDED",
            ErrorKind::GeofenceInvalidRegion => "GEOFENCE_INVALID_REGION",
            ErrorKind::GeofenceMonitoringFailed => "GEOFENCE_MONITORING_FAILED",
            ErrorKind::StorageQueryFailed => "STORAGE_QUERY_FAILED",
            ErrorKind::StorageCorrupted => "STORAGE_CORRUPTED",
            ErrorKind::StorageFull => "STORAGE_FULL",
            ErrorKind::StorageInitFailed => "STORAGE_INIT_FAILED",
            ErrorKind::EncryptionFailed => "ENCRYPTION_FAILED",
            ErrorKind::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorKind::KeyMissing => "KEY_MISSING",
            ErrorKind::ExportFailed => "EXPORT_FAILED",
            ErrorKind::AuditSignatureInvalid => "AUDIT_SIGNATURE_INVALID",
            ErrorKind::AuditChainBroken => "AUDIT_CHAIN_BROKEN",
            ErrorKind::PlatformUnsupported => "PLATFORM_UNSUPPORTED",
            ErrorKind::BackgroundTaskFailed => "BACKGROUND_TASK_FAILED",
            ErrorKind::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            ErrorKind::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::ConfigurationInvalid => "CONFIGURATION_INVALID",
            ErrorKind::ConfigurationMissing => "CONFIGURATION_MISSING",
            ErrorKind::OperationTimeout => "OPERATION_TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Functional area this kind belongs to
    pub fn domain(&self) -> ErrorDomain {
        use ErrorKind::*;
        match self {
            PermissionDenied | PermissionBackgroundDenied | PermissionRestricted => {
                ErrorDomain::Permission
            }
            LocationUnavailable
            | LocationTimeout
            | LocationAccuracyInsufficient
            | LocationServicesDisabled => ErrorDomain::Location,
            TrackingStartFailed | TrackingAlreadyActive | TrackingNotActive => {
                ErrorDomain::Tracking
            }
            GeofenceLimitExceeded | GeofenceInvalidRegion | GeofenceMonitoringFailed => {
                ErrorDomain::Geofence
            }
            StorageQueryFailed | StorageCorrupted | StorageFull | StorageInitFailed => {
                ErrorDomain::Storage
            }
            EncryptionFailed | DecryptionFailed | KeyMissing => ErrorDomain::Crypto,
            ExportFailed | AuditSignatureInvalid | AuditChainBroken => ErrorDomain::Export,
            PlatformUnsupported | BackgroundTaskFailed => ErrorDomain::Platform,
            NetworkUnavailable | NetworkTimeout | ServiceUnavailable => ErrorDomain::Network,
            ConfigurationInvalid | ConfigurationMissing => ErrorDomain::Configuration,
            OperationTimeout | Unknown => ErrorDomain::Unknown,
        }
    }

    /// Row of the defaults table for this kind
    #[rustfmt::skip]
    pub fn defaults(&self) -> KindDefaults {
        use ErrorKind::*;
        use Severity::*;
        match self {
            PermissionDenied => row(High, None, "Permission Required",
                "Location permission is required to continue.",
                Some("Open Settings")),
            PermissionBackgroundDenied => row(Medium, None, "Background Access Needed",
                "Allow location access \"Always\" to keep tracking in the background.",
                Some("Open Settings")),
            PermissionRestricted => row(High, None, "Location Restricted",
                "Location access is restricted on this device.",
                Some("Contact your administrator")),

            LocationUnavailable => row(Medium, Some((3, 2_000)), "Location Unavailable",
                "Your location could not be determined right now.", None),
            LocationTimeout => row(Medium, Some((3, 1_000)), "Location Timeout",
                "Getting your location is taking longer than expected.", None),
            LocationAccuracyInsufficient => row(Low, Some((2, 5_000)), "Low Accuracy",
                "Your location is less accurate than usual.", None),
            LocationServicesDisabled => row(High, None, "Location Services Off",
                "Turn on location services to continue.",
                Some("Enable Location Services")),

            TrackingStartFailed => row(High, Some((2, 2_000)), "Tracking Unavailable",
                "Tracking could not be started.", Some("Try Again")),
            TrackingAlreadyActive => row(Low, None, "Already Tracking",
                "Tracking is already running.", None),
            TrackingNotActive => row(Low, None, "Not Tracking",
                "Tracking is not running.", None),

            GeofenceLimitExceeded => row(Medium, None, "Too Many Zones",
                "The maximum number of zones has been reached.",
                Some("Remove a zone")),
            GeofenceInvalidRegion => row(Medium, None, "Invalid Zone",
                "This zone cannot be monitored.", Some("Edit the zone")),
            GeofenceMonitoringFailed => row(High, Some((2, 3_000)), "Zone Monitoring Failed",
                "Zone alerts may be delayed.", None),

            StorageQueryFailed => row(Medium, Some((3, 500)), "Storage Error",
                "Your data could not be read or saved. Retrying.", None),
            StorageCorrupted => row(Critical, None, "Data Problem",
                "Stored data is damaged and needs to be reset.", Some("Reset Data")),
            StorageFull => row(High, None, "Storage Full",
                "The device is out of storage space.", Some("Free up space")),
            StorageInitFailed => row(Critical, Some((1, 1_000)), "Storage Unavailable",
                "Local storage could not be opened.", None),

            EncryptionFailed => row(High, Some((1, 500)), "Security Error",
                "Your data could not be protected.", None),
            DecryptionFailed => row(High, None, "Security Error",
                "Your data could not be unlocked.", None),
            KeyMissing => row(Critical, None, "Security Key Missing",
                "The encryption key is missing and must be regenerated.",
                Some("Reset Security")),

            ExportFailed => row(Medium, Some((2, 1_000)), "Export Failed",
                "Your export could not be completed.", Some("Try Again")),
            AuditSignatureInvalid => row(High, None, "Audit Verification Failed",
                "An audit record could not be verified.", None),
            AuditChainBroken => row(Critical, None, "Audit Log Damaged",
                "The audit log is incomplete.", Some("Contact Support")),

            PlatformUnsupported => row(High, None, "Not Supported",
                "This feature is not supported on your device.", None),
            BackgroundTaskFailed => row(Medium, Some((3, 5_000)), "Background Task Failed",
                "A background task did not finish.", None),

            NetworkUnavailable => row(Medium, Some((3, 2_000)), "No Connection",
                "Check your internet connection.", Some("Retry")),
            NetworkTimeout => row(Medium, Some((3, 1_000)), "Connection Timeout",
                "The server is taking too long to respond.", Some("Retry")),
            ServiceUnavailable => row(High, Some((3, 5_000)), "Service Unavailable",
                "The service is temporarily unavailable.", None),

            ConfigurationInvalid => row(High, None, "Configuration Error",
                "The app configuration is invalid.", None),
            ConfigurationMissing => row(High, None, "Configuration Missing",
                "Required configuration is missing.", None),

            OperationTimeout => row(Medium, Some((3, 1_000)), "Timeout",
                "The operation took too long.", Some("Try Again")),
            Unknown => row(Medium, Some((1, 1_000)), "Something Went Wrong",
                "An unexpected error occurred.", None),
        }
    }

    /// Default severity for this kind
    pub fn default_severity(&self) -> Severity {
        self.defaults().severity
    }

    /// Default recovery policy for this kind
    pub fn default_recovery_policy(&self) -> RecoveryPolicy {
        let d = self.defaults();
        RecoveryPolicy {
            can_retry: d.can_retry,
            max_retries: d.max_retries,
            retry_delay: d.retry_delay,
            user_action: d.user_action.map(str::to_string),
        }
    }

    /// Default user-facing message for this kind
    pub fn default_user_message(&self) -> UserMessage {
        let d = self.defaults();
        UserMessage {
            title: d.title.to_string(),
            message: d.message.to_string(),
            action: d.user_action.map(str::to_string),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Ordinal urgency of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// One row of the per-kind defaults table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindDefaults {
    pub severity: Severity,
    pub can_retry: bool,
    pub max_retries: u32,
    pub retry_delay: Option<Duration>,
    pub title: &'static str,
    pub message: &'static str,
    pub user_action: Option<&'static str>,
}

const fn row(
    severity: Severity,
    retry: Option<(u32, u64)>,
    title: &'static str,
    message: &'static str,
    user_action: Option<&'static str>,
) -> KindDefaults {
    let (can_retry, max_retries, retry_delay) = match retry {
        Some((max, delay_ms)) => (true, max, Some(Duration::from_millis(delay_ms))),
        None => (false, 0, None),
    };
    KindDefaults {
        severity,
        can_retry,
        max_retries,
        retry_delay,
        title,
        message,
        user_action,
    }
}

/// Anything that can be handed to `dispatch` or returned from a wrapped
/// operation
#[derive(Debug, Clone)]
pub enum Failure {
    /// Already classified
    Record(ErrorRecord),

    /// Opaque error value, classified by message
    Opaque(Arc<dyn StdError + Send + Sync>),

    /// Bare message
    Message(String),
}

impl From<ErrorRecord> for Failure {
    fn from(record: ErrorRecord) -> Self {
        Failure::Record(record)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ErrorRecord>() {
            Ok(record) => Failure::Record(record),
            Err(err) => {
                let boxed: Box<dyn StdError + Send + Sync> = err.into();
                Failure::Opaque(Arc::from(boxed))
            }
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::Opaque(Arc::new(err))
    }
}

impl From<Box<dyn StdError + Send + Sync>> for Failure {
    fn from(err: Box<dyn StdError + Send + Sync>) -> Self {
        match err.downcast::<ErrorRecord>() {
            Ok(record) => Failure::Record(*record),
            Err(err) => Failure::Opaque(Arc::from(err)),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Failure::Message(message)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Failure::Message(message.to_string())
    }
}

/// Wraps a bare message so it can be kept as a record's cause
#[derive(Debug, Clone)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

/// Converts arbitrary failures into `ErrorRecord`s
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Normalize any failure into an `ErrorRecord`
    ///
    /// An `ErrorRecord` is returned unchanged, so normalization is
    /// idempotent. Opaque failures are classified by keyword and preserved
    /// as the record's cause.
    pub fn normalize(failure: impl Into<Failure>, context: Option<ErrorContext>) -> ErrorRecord {
        let (message, cause): (String, Arc<dyn StdError + Send + Sync>) = match failure.into() {
            Failure::Record(record) => return record,
            Failure::Opaque(err) => (err.to_string(), err),
            Failure::Message(message) => {
                (message.clone(), Arc::new(MessageError(message)))
            }
        };

        let kind = Self::classify_message(&message);
        let context = context.unwrap_or_else(|| ErrorContext::new("unknown", "unknown"));

        ErrorRecord::builder(kind)
            .message(message)
            .context(context)
            .cause(cause)
            .build()
    }

    /// Best-effort keyword classification of a failure message
    ///
    /// Heuristic: a storage message that mentions "network" is reported as a
    /// network failure. Collaborators should raise typed records instead
    /// wherever they can.
    pub fn classify_message(message: &str) -> ErrorKind {
        let lower = message.to_lowercase();

        if lower.contains("permission") {
            ErrorKind::PermissionDenied
        } else if lower.contains("location") && lower.contains("timeout") {
            ErrorKind::LocationTimeout
        } else if lower.contains("location") {
            ErrorKind::LocationUnavailable
        } else if lower.contains("database") {
            ErrorKind::StorageQueryFailed
        } else if lower.contains("network") {
            ErrorKind::NetworkUnavailable
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ErrorKind::OperationTimeout
        } else {
            ErrorKind::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn test_every_kind_has_a_title_and_message() {
        for kind in ErrorKind::ALL {
            let msg = kind.default_user_message();
            assert!(!msg.title.is_empty(), "{} has no title", kind);
            assert!(!msg.message.is_empty(), "{} has no message", kind);
        }
    }

    #[test]
    fn test_non_retryable_kinds_have_no_retry_budget() {
        for kind in ErrorKind::ALL {
            let policy = kind.default_recovery_policy();
            if !policy.can_retry {
                assert_eq!(policy.max_retries, 0, "{}", kind);
            }
        }
    }

    #[test]
    fn test_permission_kinds_require_user_action() {
        for kind in ErrorKind::ALL
            .iter()
            .filter(|k| k.domain() == ErrorDomain::Permission)
        {
            let policy = kind.default_recovery_policy();
            assert!(!policy.can_retry);
            assert!(policy.user_action.is_some());
        }
    }

    #[test_case(ErrorKind::StorageCorrupted ; "storage corruption")]
    #[test_case(ErrorKind::KeyMissing ; "missing key")]
    #[test_case(ErrorKind::AuditChainBroken ; "broken audit chain")]
    fn test_data_integrity_kinds_are_critical_and_final(kind: ErrorKind) {
        assert_eq!(kind.default_severity(), Severity::Critical);
        assert!(!kind.default_recovery_policy().can_retry);
    }

    #[test_case(ErrorKind::OperationTimeout)]
    #[test_case(ErrorKind::NetworkUnavailable)]
    #[test_case(ErrorKind::NetworkTimeout)]
    #[test_case(ErrorKind::StorageQueryFailed)]
    fn test_transient_kinds_are_retryable(kind: ErrorKind) {
        assert!(kind.default_recovery_policy().can_retry);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_kind_serializes_as_code() {
        for kind in ErrorKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.code().to_string()));
        }
    }

    #[test_case("Permission denied by user", ErrorKind::PermissionDenied)]
    #[test_case("LOCATION request TIMEOUT", ErrorKind::LocationTimeout)]
    #[test_case("location provider missing", ErrorKind::LocationUnavailable)]
    #[test_case("database is locked", ErrorKind::StorageQueryFailed)]
    #[test_case("network unreachable", ErrorKind::NetworkUnavailable)]
    #[test_case("request timed out", ErrorKind::OperationTimeout)]
    #[test_case("something odd", ErrorKind::Unknown)]
    fn test_classify_message(message: &str, expected: ErrorKind) {
        assert_eq!(ErrorClassifier::classify_message(message), expected);
    }

    #[test]
    fn test_classify_message_heuristic_can_misclassify() {
        // Storage failure mentioning the network is reported as network
        assert_eq!(
            ErrorClassifier::classify_message("sync store failed: network socket closed"),
            ErrorKind::NetworkUnavailable
        );
    }

    #[test]
    fn test_normalize_preserves_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "database disk image");
        let record = ErrorClassifier::normalize(io, None);

        assert_eq!(record.kind, ErrorKind::StorageQueryFailed);
        assert!(record.context.cause.is_some());
        assert!(StdError::source(&record).is_some());
        assert_eq!(record.message, "database disk image");
    }

    #[test]
    fn test_normalize_uses_supplied_context() {
        let context = ErrorContext::new("upload", "sync");
        let record = ErrorClassifier::normalize("network down", Some(context));
        assert_eq!(record.context.operation, "upload");
        assert_eq!(record.context.component, "sync");
    }

    #[test]
    fn test_normalize_unwraps_record_inside_anyhow() {
        let original = ErrorRecord::new(ErrorKind::KeyMissing, "no key");
        let wrapped = anyhow::Error::new(original.clone());
        let record = ErrorClassifier::normalize(wrapped, None);

        assert_eq!(record.kind, ErrorKind::KeyMissing);
        assert_eq!(record.context.timestamp, original.context.timestamp);
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(message in ".*") {
            let once = ErrorClassifier::normalize(message.as_str(), None);
            let twice = ErrorClassifier::normalize(once.clone(), None);

            prop_assert_eq!(once.kind, twice.kind);
            prop_assert_eq!(once.severity, twice.severity);
            prop_assert_eq!(&once.message, &twice.message);
            prop_assert_eq!(once.context.timestamp, twice.context.timestamp);
        }
    }
}
