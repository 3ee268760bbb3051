pub mod coordinator;
pub mod dispatch;
pub mod journal;
pub mod mailbox;
pub mod monitor;
pub mod router;
pub mod store;
pub mod workflow;

pub use coordinator::{Assignment, Coordinator, CoordinatorError, TaskUpdate};
pub use dispatch::{
    dispatcher_from_config, DispatchError, DispatchRequest, Dispatcher, FileDropDispatcher,
    HookDispatcher, Urgency,
};
pub use journal::Journal;
pub use mailbox::{
    DeliveryReport, HandlerError, Mailbox, MailboxTransport, MessageHandler, TransportError,
};
pub use monitor::{
    classify, ActivityMonitor, ActivityRecord, ActivitySource, AgentStatus, EscalationLevel,
    FileSignalSource, Thresholds, TickReport,
};
pub use router::{CommandRouter, RouteOutcome, RouterError};
pub use store::{StoreError, TaskStore};
pub use workflow::{
    OrchestrationStrategy, RunStatus, StepStatus, Workflow, WorkflowBuilder, WorkflowEngine,
    WorkflowError, WorkflowRun, WorkflowStep,
};
