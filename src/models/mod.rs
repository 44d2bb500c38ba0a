pub mod alert;
pub mod escalation;
pub mod incident;
pub mod log_record;
pub mod org;
pub mod task;
pub mod user;

pub use alert::{Alert, AlertGroup, GroupStatus, GroupingCounter};
pub use escalation::{
    EscalationChain, EscalationPolicy, EscalationSnapshot, EscalationStepKind, SnapshotStep,
};
pub use incident::{IncidentRecord, IncidentStatus, RemoteIncident};
pub use log_record::{LogRecord, LogRecordType};
pub use org::{ChannelFilter, Integration, IntegrationKind, Organization, Team};
pub use task::{
    DeclareIncidentPayload, EscalateStepPayload, FlushBundlePayload, NotifyUserPayload,
    ScheduledTask, TaskKind, TaskStatus, TriggerWebhookPayload, UnsilencePayload,
};
pub use user::{
    ChannelKind, NotificationPolicyStep, PolicyStepKind, PolicyTier, Schedule, User, UserGroup,
};
