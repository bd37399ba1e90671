//! Request validation for task creation (spec §4.1: "Validates ...
//! cron_expression", "Validates ... each subtask's name resolves to a
//! known kind"). Runs before a task row is ever written.

use crate::error::{CoreError, Result};
use crate::models::{CreateTaskRequest, SubtaskKind};
use crate::scheduler::cron;

pub const MAX_TASK_NAME_LENGTH: usize = 200;
pub const MAX_SUBTASKS_PER_TASK: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct TaskValidator;

impl TaskValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_create(&self, request: &CreateTaskRequest) -> Result<()> {
        if request.name.trim().is_empty() {
            return Err(CoreError::InvalidInput("task name cannot be empty".to_string()));
        }
        if request.name.len() > MAX_TASK_NAME_LENGTH {
            return Err(CoreError::InvalidInput(format!(
                "task name exceeds maximum length of {MAX_TASK_NAME_LENGTH} characters"
            )));
        }

        if let Some(expr) = &request.cron_expression {
            cron::validate(expr)?;
        }

        if request.subtasks.is_empty() {
            return Err(CoreError::InvalidInput("task must have at least one subtask".to_string()));
        }
        if request.subtasks.len() > MAX_SUBTASKS_PER_TASK {
            return Err(CoreError::InvalidInput(format!(
                "task has {} subtasks, exceeding the limit of {MAX_SUBTASKS_PER_TASK}",
                request.subtasks.len()
            )));
        }

        for subtask in &request.subtasks {
            if SubtaskKind::parse(&subtask.name).is_none() {
                return Err(CoreError::InvalidInput(format!(
                    "subtask name '{}' does not match a known subtask kind",
                    subtask.name
                )));
            }
            if subtask.target_agent.trim().is_empty() {
                return Err(CoreError::InvalidInput(
                    "subtask target_agent cannot be empty".to_string(),
                ));
            }
            if subtask.timeout_seconds == 0 {
                return Err(CoreError::InvalidInput(
                    "subtask timeout_seconds must be greater than zero".to_string(),
                ));
            }
        }

        for recipient in &request.email_recipients {
            if !recipient.contains('@') {
                return Err(CoreError::InvalidInput(format!(
                    "email recipient '{recipient}' does not look like an address"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Subtask;

    fn base_request() -> CreateTaskRequest {
        CreateTaskRequest {
            name: "nightly build check".to_string(),
            subtasks: vec![Subtask {
                name: "get_hostname".to_string(),
                target_agent: "builder-1".to_string(),
                order: 0,
                args: serde_json::json!({}),
                kwargs: serde_json::json!({}),
                timeout_seconds: 30,
                max_retries: 0,
                stop_on_failure: false,
            }],
            schedule_time: None,
            cron_expression: None,
            send_email: false,
            email_recipients: vec![],
            max_retries: 0,
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let validator = TaskValidator::new();
        assert!(validator.validate_create(&base_request()).is_ok());
    }

    #[test]
    fn rejects_an_empty_name() {
        let validator = TaskValidator::new();
        let mut request = base_request();
        request.name = "  ".to_string();
        assert!(validator.validate_create(&request).is_err());
    }

    #[test]
    fn rejects_an_unknown_subtask_kind() {
        let validator = TaskValidator::new();
        let mut request = base_request();
        request.subtasks[0].name = "rm_rf_slash".to_string();
        assert!(validator.validate_create(&request).is_err());
    }

    #[test]
    fn rejects_a_malformed_cron_expression() {
        let validator = TaskValidator::new();
        let mut request = base_request();
        request.cron_expression = Some("not a cron expression".to_string());
        assert!(validator.validate_create(&request).is_err());
    }

    #[test]
    fn rejects_a_malformed_email_recipient() {
        let validator = TaskValidator::new();
        let mut request = base_request();
        request.email_recipients = vec!["not-an-address".to_string()];
        assert!(validator.validate_create(&request).is_err());
    }

    #[test]
    fn rejects_an_empty_subtask_list() {
        let validator = TaskValidator::new();
        let mut request = base_request();
        request.subtasks.clear();
        assert!(validator.validate_create(&request).is_err());
    }
}
