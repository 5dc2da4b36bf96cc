use super::action::{
    AbortTaskAction, ChangeOwnerTaskAction, CheckSchedulabilityAction, RescheduleTaskAction,
    RunContextAction, ScheduleTaskAction, TaskAction, TaskContextCheckerAction,
};
use crate::model::TaskEntry;
use crate::store::Versioned;

/// Messages flowing from listeners and the scanner to the action processor.
///
/// Task-carrying variants hold the snapshot that justified the message; actions compare its
/// version against the store before they change anything.
#[derive(Debug, Clone)]
pub enum TaskMessage {
    NewTask(Versioned<TaskEntry>),
    ScheduleTask(Versioned<TaskEntry>),
    CheckSchedulability(Versioned<TaskEntry>),
    /// A task reached a final state.
    TaskChanged(Versioned<TaskEntry>),
    AbortTask { task_id: String, reason: String },
    RunContext { context_id: String },
    ChangeOwner(Versioned<TaskEntry>),
    RescheduleTask(Versioned<TaskEntry>),
    /// Stops the processor.
    Poison,
}

impl TaskMessage {
    /// The action handling this message; `None` for `Poison`.
    pub fn into_action(self) -> Option<Box<dyn TaskAction>> {
        let action: Box<dyn TaskAction> = match self {
            Self::NewTask(entry) | Self::ScheduleTask(entry) => {
                Box::new(ScheduleTaskAction::new(entry))
            }
            Self::CheckSchedulability(entry) => Box::new(CheckSchedulabilityAction::new(entry)),
            Self::TaskChanged(entry) => Box::new(TaskContextCheckerAction::new(entry)),
            Self::AbortTask { task_id, reason } => Box::new(AbortTaskAction::new(task_id, reason)),
            Self::RunContext { context_id } => Box::new(RunContextAction::new(context_id)),
            Self::ChangeOwner(entry) => Box::new(ChangeOwnerTaskAction::new(entry)),
            Self::RescheduleTask(entry) => Box::new(RescheduleTaskAction::new(entry)),
            Self::Poison => return None,
        };
        Some(action)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewTask(_) => "new_task",
            Self::ScheduleTask(_) => "schedule_task",
            Self::CheckSchedulability(_) => "check_schedulability",
            Self::TaskChanged(_) => "task_changed",
            Self::AbortTask { .. } => "abort_task",
            Self::RunContext { .. } => "run_context",
            Self::ChangeOwner(_) => "change_owner",
            Self::RescheduleTask(_) => "reschedule_task",
            Self::Poison => "poison",
        }
    }
}
