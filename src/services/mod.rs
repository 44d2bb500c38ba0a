pub mod bulk;
pub mod escalation;
pub mod grouping;
pub mod incident;
pub mod log_records;
pub mod notification;
pub mod paging;
pub mod policy;
pub mod rate_limit;
pub mod snapshot;
pub mod state_machine;
pub mod stepper;

pub use bulk::{BulkAction, BulkActionService, BulkOutcome};
pub use escalation::{DbOnCallResolver, EscalationService, OnCallResolver};
pub use grouping::GroupingService;
pub use incident::{HttpIncidentApi, IncidentApi, IncidentApiError, IncidentConnectorService};
pub use log_records::LogRecordService;
pub use notification::{Notifier, NotifierRegistry, NotifyError, WebhookNotifier};
pub use paging::{DirectPagingService, PageRequest};
pub use policy::NotificationPolicyService;
pub use rate_limit::RateLimitService;
pub use snapshot::SnapshotService;
pub use state_machine::{AlertGroupService, GroupAction, UnsilenceSource};
pub use stepper::NotificationStepperService;
