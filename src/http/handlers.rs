use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::downloader::models::{content_range, parse_range_start};
use crate::downloader::{
    CommandResult, DirectStream, DownloadError, DownloadManager, DownloadRequest, ResumeOutcome, SubmitOutcome,
    Task,
};

pub type AppState = Arc<DownloadManager>;

const X_TASK_ID: HeaderName = HeaderName::from_static("x-task-id");
const X_RESUME_OFFSET: HeaderName = HeaderName::from_static("x-resume-offset");

/// 把引擎错误转换成 {code, message} 响应，HTTP 状态码与 code 一致
pub struct ApiError(DownloadError);

impl From<DownloadError> for ApiError {
    fn from(e: DownloadError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = CommandResult::from_error(&self.0);
        let status = StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("请求处理失败：{}", self.0);
        } else {
            debug!("请求被拒绝：{}", self.0);
        }
        let mut headers = HeaderMap::new();
        if let DownloadError::RangeNotSatisfiable { size, .. } = &self.0 {
            if let Ok(range) = HeaderValue::from_str(&format!("bytes */{size}")) {
                headers.insert(header::CONTENT_RANGE, range);
            }
        }
        (status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: String,
}

fn range_start(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_start)
}

/// `attachment; filename="..."; filename*=UTF-8''...`，非 ASCII 文件名只出现在 filename* 中
fn content_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' { c } else { '_' })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(file_name)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn insert_number(headers: &mut HeaderMap, name: HeaderName, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

fn direct_response(stream: DirectStream) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(task_id) = HeaderValue::from_str(&stream.task_id) {
        headers.insert(X_TASK_ID, task_id);
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(stream.content_type));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&stream.file_name));

    let mut status = StatusCode::OK;
    match stream.range {
        Some((start, size)) => {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            insert_number(&mut headers, header::CONTENT_LENGTH, size.saturating_sub(start));
            if start > 0 {
                status = StatusCode::PARTIAL_CONTENT;
                if let Ok(range) = HeaderValue::from_str(&content_range(start, size)) {
                    headers.insert(header::CONTENT_RANGE, range);
                }
            }
        }
        None => insert_number(&mut headers, X_RESUME_OFFSET, stream.resume_offset),
    }

    let body = Body::from_stream(ReaderStream::new(stream.reader));
    (status, headers, body).into_response()
}

fn submit_response(outcome: SubmitOutcome, message: &str) -> Response {
    match outcome {
        SubmitOutcome::Stored { task_id } => Json(CommandResult::with_task(task_id, message)).into_response(),
        SubmitOutcome::Direct(stream) => direct_response(stream),
    }
}

pub async fn submit(
    State(manager): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let outcome = manager.submit(request, range_start(&headers)).await?;
    Ok(submit_response(outcome, "任务已提交"))
}

pub async fn task_status(State(manager): State<AppState>, Path(task_id): Path<String>) -> ApiResult<Json<Task>> {
    manager
        .get_task(&task_id)
        .map(Json)
        .ok_or_else(|| DownloadError::TaskNotFound(task_id).into())
}

pub async fn all_tasks(State(manager): State<AppState>) -> Json<Vec<Task>> {
    Json(manager.list_tasks())
}

pub async fn cancel(State(manager): State<AppState>, Path(task_id): Path<String>) -> ApiResult<Json<CommandResult>> {
    Ok(Json(manager.cancel(&task_id).await?))
}

pub async fn resume(
    State(manager): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    match manager.resume(&task_id, &query.user_id, range_start(&headers)).await? {
        ResumeOutcome::AlreadyRunning => Ok(Json(CommandResult::with_task(task_id, "任务正在运行")).into_response()),
        ResumeOutcome::Resumed(outcome) => Ok(submit_response(outcome, "任务已恢复")),
    }
}

pub async fn retry(
    State(manager): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Response> {
    let outcome = manager.retry(&task_id, &query.user_id).await?;
    Ok(submit_response(outcome, "已创建重试任务"))
}

pub async fn discard(
    State(manager): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<CommandResult>> {
    manager.discard(&task_id, &query.user_id).await?;
    Ok(Json(CommandResult::with_task(task_id, "断点已清除")))
}

pub async fn progress(
    State(manager): State<AppState>,
    Path(task_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = manager.subscribe(&task_id).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event("progress").data(data))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

pub async fn download_stored(
    State(manager): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Response> {
    let stored = manager.open_stored(&task_id, &query.user_id).await?;
    let file = tokio::fs::File::open(&stored.path)
        .await
        .map_err(|_| DownloadError::FileNotFound(stored.path.clone()))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(stored.content_type));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&stored.file_name));
    insert_number(&mut headers, header::CONTENT_LENGTH, stored.size);

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_keeps_ascii_fallback() {
        let value = content_disposition("报告 2024.zip");
        let text = value.to_str().unwrap();
        assert!(text.starts_with("attachment; filename=\"__ 2024.zip\""));
        assert!(text.contains("filename*=UTF-8''%E6%8A%A5%E5%91%8A%202024.zip"));
    }

    #[test]
    fn test_range_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(range_start(&headers), None);
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=512-"));
        assert_eq!(range_start(&headers), Some(512));
    }

    #[test]
    fn test_error_status_matches_code() {
        let response = ApiError(DownloadError::InsufficientSpace {
            path: "/data".into(),
            available: 1,
            required: 2,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
        let response = ApiError(DownloadError::Unauthorized("t".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
