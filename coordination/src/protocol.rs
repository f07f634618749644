//! Line-delimited JSON request/response protocol
//!
//! Each input line is one request:
//!
//! ```text
//! {"task": "...", "priority": "high", "options": {"taskTimeoutMs": 60000}}
//! ```
//!
//! `description` is accepted in place of `task`. Success is written as
//! `{"taskId", "consensus", "results"}`, failure as `{"error"}` plus
//! `taskId` once the task had been assigned one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::DispatchError;
use crate::orchestrator::{Orchestrator, TaskFailure, TaskOptions, TaskReport};
use crate::state::{Priority, TaskId};

/// Per-request overrides. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub task_timeout_ms: Option<u64>,
    pub max_concurrency: Option<usize>,
}

impl From<RequestOptions> for TaskOptions {
    fn from(options: RequestOptions) -> Self {
        TaskOptions {
            task_timeout: options.task_timeout_ms.map(Duration::from_millis),
            max_concurrency: options.max_concurrency,
        }
    }
}

/// Raw request as read from the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub task: Option<Value>,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub priority: Option<Value>,
    #[serde(default)]
    pub options: Option<RequestOptions>,
}

fn is_truthy_text(value: &Option<Value>) -> bool {
    match value {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

impl TaskRequest {
    /// `task`, else `description`, as a string. Non-string values yield an
    /// empty description, which validation then rejects.
    pub fn description(&self) -> String {
        let chosen = if is_truthy_text(&self.task) {
            &self.task
        } else {
            &self.description
        };
        match chosen {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Parsed priority, `normal` when absent.
    pub fn priority(&self) -> Result<Priority, DispatchError> {
        match &self.priority {
            None | Some(Value::Null) => Ok(Priority::Normal),
            Some(Value::String(s)) if s.is_empty() => Ok(Priority::Normal),
            Some(Value::String(s)) => s.parse(),
            Some(_) => Err(DispatchError::validation(
                "priority",
                "must be one of low|normal|high.",
            )),
        }
    }

    pub fn options(&self) -> TaskOptions {
        self.options.clone().unwrap_or_default().into()
    }
}

/// `{"error": "...", "taskId": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            task_id: None,
        }
    }
}

impl From<TaskFailure> for ErrorResponse {
    fn from(failure: TaskFailure) -> Self {
        Self {
            error: failure.error.to_string(),
            task_id: failure.task_id,
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone)]
pub enum Response {
    Success(TaskReport),
    Failure(ErrorResponse),
}

impl Response {
    fn failure(message: impl Into<String>) -> Self {
        Response::Failure(ErrorResponse::new(message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// Single JSON line, newline included.
    pub fn to_line(&self) -> String {
        let encoded = match self {
            Response::Success(report) => serde_json::to_string(report),
            Response::Failure(err) => serde_json::to_string(err),
        };
        let mut line = encoded.unwrap_or_else(|e| format!(r#"{{"error":"{e}"}}"#));
        line.push('\n');
        line
    }
}

/// Handle one raw request line.
pub async fn handle_line(orchestrator: &Orchestrator, raw: &str) -> Response {
    let request: TaskRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(e) => return Response::failure(format!("Invalid request JSON: {e}")),
    };

    let priority = match request.priority() {
        Ok(priority) => priority,
        Err(e) => return Response::failure(e.to_string()),
    };

    match orchestrator
        .orchestrate_task(&request.description(), priority, request.options())
        .await
    {
        Ok(report) => Response::Success(report),
        Err(failure) => Response::Failure(failure.into()),
    }
}

/// Read requests line by line until EOF, handling each in turn. Blank lines
/// are skipped and a final unterminated line is still handled. A line that
/// is not valid UTF-8 is answered with an error and the loop goes on.
pub async fn serve<R, O, E>(
    orchestrator: &Orchestrator,
    mut input: R,
    mut out: O,
    mut err: E,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut handled = 0;

    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let raw = strip_line_ending(&buf);
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let response = match std::str::from_utf8(raw) {
            Ok(line) => handle_line(orchestrator, line).await,
            Err(e) => Response::failure(format!("Invalid request encoding: {e}")),
        };
        handled += 1;
        debug!(handled, success = response.is_success(), "Request handled");

        let sink: &mut (dyn AsyncWrite + Unpin) = if response.is_success() {
            &mut out
        } else {
            &mut err
        };
        sink.write_all(response.to_line().as_bytes()).await?;
        sink.flush().await?;
    }

    Ok(handled)
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
