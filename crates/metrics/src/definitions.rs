//! Metric name and label definitions.

/// Streaming-reply orchestrator metrics
pub mod wecom {
    /// Total number of inbound webhook messages accepted
    pub const MESSAGES_RECEIVED_TOTAL: &str = "wecom_messages_received_total";
    /// Total number of inbound messages folded into another message's dispatch
    pub const MESSAGES_MERGED_TOTAL: &str = "wecom_messages_merged_total";
    /// Total number of duplicate webhook deliveries acknowledged without processing
    pub const DUPLICATES_TOTAL: &str = "wecom_duplicates_total";
    /// Outbound deliveries, labelled by `tier`
    pub const DELIVERIES_TOTAL: &str = "wecom_deliveries_total";
    /// Streams reaching the terminal state, labelled by `reason`
    pub const STREAMS_FINISHED_TOTAL: &str = "wecom_streams_finished_total";
    /// Number of live streams in the registry
    pub const STREAMS_ACTIVE: &str = "wecom_streams_active";
    /// Agent dispatch failures caught at the serializer boundary
    pub const DISPATCH_ERRORS_TOTAL: &str = "wecom_dispatch_errors_total";
    /// Agent dispatch duration in seconds
    pub const DISPATCH_DURATION_SECONDS: &str = "wecom_dispatch_duration_seconds";
}

/// Common label keys
pub mod labels {
    pub const TIER: &str = "tier";
    pub const REASON: &str = "reason";
}
