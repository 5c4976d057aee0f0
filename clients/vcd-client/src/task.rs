// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous tasks the cloud returns for long-running operations.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Task {
    pub href: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub error: Option<TaskError>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct TaskError {
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    Pending,
    Succeeded,
    Failed,
}

impl Task {
    pub fn progress(&self) -> Progress {
        match self.status.as_str() {
            "success" => Progress::Succeeded,
            "error" | "canceled" | "aborted" => Progress::Failed,
            // "queued", "preRunning", "running" and anything newer.
            _ => Progress::Pending,
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .filter(|m| !m.is_empty())
            .or_else(|| self.operation.clone())
            .unwrap_or_default()
    }
}

/// Tasks embedded in an entity that is still being created.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct Tasks {
    #[serde(default)]
    pub task: Vec<Task>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_task_status() {
        let task = |status: &str| Task {
            href: "https://vcd.example/api/task/1".to_string(),
            status: status.to_string(),
            operation: None,
            error: None,
        };
        assert_eq!(task("success").progress(), Progress::Succeeded);
        assert_eq!(task("running").progress(), Progress::Pending);
        assert_eq!(task("queued").progress(), Progress::Pending);
        assert_eq!(task("error").progress(), Progress::Failed);
        assert_eq!(task("aborted").progress(), Progress::Failed);
    }

    #[test]
    fn error_message_prefers_task_error() {
        let body = r#"{
            "href": "https://vcd.example/api/task/2",
            "status": "error",
            "operation": "Attaching disk data1",
            "error": {"message": "disk is busy", "majorErrorCode": 400}
        }"#;
        let task: Task = serde_json::from_str(body).unwrap();
        assert_eq!(task.progress(), Progress::Failed);
        assert_eq!(task.error_message(), "disk is busy");

        let body = r#"{"href": "h", "status": "aborted", "operation": "Detaching"}"#;
        let task: Task = serde_json::from_str(body).unwrap();
        assert_eq!(task.error_message(), "Detaching");
    }
}
