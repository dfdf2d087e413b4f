//! Configuration keys consumed by the library, declared with factory
//! defaults and validators at startup.

use super::{id_tag_string, non_negative_int, ConfigValue, ConfigurationStore};

pub const MINIMUM_STATUS_DURATION: &str = "MinimumStatusDuration";
pub const CONNECTION_TIME_OUT: &str = "ConnectionTimeOut";
pub const AUTHORIZATION_TIMEOUT: &str = "AuthorizationTimeout";
pub const STOP_TRANSACTION_ON_INVALID_ID: &str = "StopTransactionOnInvalidId";
pub const STOP_TRANSACTION_ON_EV_SIDE_DISCONNECT: &str = "StopTransactionOnEVSideDisconnect";
pub const UNLOCK_CONNECTOR_ON_EV_SIDE_DISCONNECT: &str = "UnlockConnectorOnEVSideDisconnect";
pub const LOCAL_PRE_AUTHORIZE: &str = "LocalPreAuthorize";
pub const ALLOW_OFFLINE_TX_FOR_UNKNOWN_ID: &str = "AllowOfflineTxForUnknownId";
pub const SILENT_OFFLINE_TRANSACTIONS: &str = "SilentOfflineTransactions";
pub const FREE_VEND_ACTIVE: &str = "FreeVendActive";
pub const FREE_VEND_ID_TAG: &str = "FreeVendIdTag";
pub const HEARTBEAT_INTERVAL: &str = "HeartbeatInterval";
pub const METER_VALUE_SAMPLE_INTERVAL: &str = "MeterValueSampleInterval";
pub const AUTHORIZE_REMOTE_TX_REQUESTS: &str = "AuthorizeRemoteTxRequests";
pub const AUTHORIZATION_CACHE_ENABLED: &str = "AuthorizationCacheEnabled";
pub const TRANSACTION_MESSAGE_ATTEMPTS: &str = "TransactionMessageAttempts";
pub const TRANSACTION_MESSAGE_RETRY_INTERVAL: &str = "TransactionMessageRetryInterval";
pub const NUMBER_OF_CONNECTORS: &str = "NumberOfConnectors";
pub const SUPPORTED_FEATURE_PROFILES: &str = "SupportedFeatureProfiles";

/// Persisted availability per connector; suffix is the connector id.
pub const AVAILABILITY_CONNECTOR_PREFIX: &str = "AvailabilityConnector";

/// Firmware bookkeeping, persisted across reboots.
pub const FIRMWARE_PREVIOUS_BUILD_NUMBER: &str = "FirmwarePreviousBuildNumber";
pub const FIRMWARE_LAST_REPORTED_STATUS: &str = "FirmwareLastReportedStatus";

pub fn availability_key(connector_id: u32) -> String {
    format!("{AVAILABILITY_CONNECTOR_PREFIX}{connector_id}")
}

/// Declare every key the library consumes. Persisted values recorded in
/// earlier sessions override these defaults where they pass validation.
pub fn register_defaults(cfg: &mut ConfigurationStore, connector_count: u32) {
    cfg.declare_validated(MINIMUM_STATUS_DURATION, ConfigValue::Int(0), non_negative_int);
    cfg.declare_validated(CONNECTION_TIME_OUT, ConfigValue::Int(30), non_negative_int);
    cfg.declare_validated(AUTHORIZATION_TIMEOUT, ConfigValue::Int(20), non_negative_int);
    cfg.declare(STOP_TRANSACTION_ON_INVALID_ID, ConfigValue::Bool(true));
    cfg.declare(
        STOP_TRANSACTION_ON_EV_SIDE_DISCONNECT,
        ConfigValue::Bool(true),
    );
    cfg.declare(
        UNLOCK_CONNECTOR_ON_EV_SIDE_DISCONNECT,
        ConfigValue::Bool(true),
    );
    cfg.declare(LOCAL_PRE_AUTHORIZE, ConfigValue::Bool(false));
    cfg.declare(ALLOW_OFFLINE_TX_FOR_UNKNOWN_ID, ConfigValue::Bool(false));
    cfg.declare(SILENT_OFFLINE_TRANSACTIONS, ConfigValue::Bool(false));
    cfg.declare(FREE_VEND_ACTIVE, ConfigValue::Bool(false));
    cfg.declare_validated(
        FREE_VEND_ID_TAG,
        ConfigValue::String(String::new()),
        id_tag_string,
    );
    cfg.declare_validated(HEARTBEAT_INTERVAL, ConfigValue::Int(86_400), non_negative_int);
    cfg.declare_validated(
        METER_VALUE_SAMPLE_INTERVAL,
        ConfigValue::Int(0),
        non_negative_int,
    );
    cfg.declare(AUTHORIZE_REMOTE_TX_REQUESTS, ConfigValue::Bool(false));
    cfg.declare(AUTHORIZATION_CACHE_ENABLED, ConfigValue::Bool(true));
    cfg.declare_validated(
        TRANSACTION_MESSAGE_ATTEMPTS,
        ConfigValue::Int(5),
        non_negative_int,
    );
    cfg.declare_validated(
        TRANSACTION_MESSAGE_RETRY_INTERVAL,
        ConfigValue::Int(60),
        non_negative_int,
    );
    cfg.declare_readonly(
        NUMBER_OF_CONNECTORS,
        ConfigValue::Int(i64::from(connector_count)),
    );
    cfg.declare_readonly(
        SUPPORTED_FEATURE_PROFILES,
        ConfigValue::String("Core,FirmwareManagement,Reservation,RemoteTrigger".into()),
    );
    cfg.declare_readonly(
        FIRMWARE_PREVIOUS_BUILD_NUMBER,
        ConfigValue::String(String::new()),
    );
    cfg.declare_readonly(
        FIRMWARE_LAST_REPORTED_STATUS,
        ConfigValue::String(String::new()),
    );

    for connector_id in 1..=connector_count {
        // 0 Inoperative / 1 InoperativeScheduled / 2 Operative
        cfg.declare_readonly(&availability_key(connector_id), ConfigValue::Int(2));
    }
}
