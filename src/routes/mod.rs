//! API routes

mod sessions;
mod surface;

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::conversation::{Message, Role};
use crate::core::assembler::split_thinking;
use crate::core::tokenizer::available_tokens;
use crate::core::{
    ChatError, ChatSession, CompletionAdapter, ConversationMemory, GenerationSettings, TokenUsage, MIN_MEMORY_TOKENS,
};
use crate::AppState;

pub use sessions::SessionStore;
pub use surface::{ChannelSurface, SurfaceEvent};

/// Errors returned by the handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Session {0} not found")]
    SessionNotFound(Uuid),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Chat(ChatError::Busy) => StatusCode::CONFLICT,
            ApiError::Chat(ChatError::Configuration(_) | ChatError::MissingCredential { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Chat(ChatError::Generation { .. }) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub company: String,
    pub name: String,
    pub context_length: usize,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    /// Whether the provider's API key is present
    pub available: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub settings: GenerationSettings,
    #[serde(default)]
    pub memory_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
    pub model: String,
    pub token_usage: TokenUsage,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub settings: GenerationSettings,
    pub messages: Vec<MessageView>,
    pub token_usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct MemoryLimitRequest {
    pub max_tokens: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions.len().await,
    })
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelInfo>> {
    let models = state
        .catalog
        .entries()
        .map(|entry| {
            let available = state
                .catalog
                .provider(&entry.provider)
                .ok()
                .and_then(|p| p.api_key_env.as_deref())
                .map_or(true, |env_var| state.credentials.get(env_var).is_some());
            ModelInfo {
                available,
                id: entry.id,
                provider: entry.provider,
                company: entry.company,
                name: entry.spec.name,
                context_length: entry.spec.context_length,
                default_temperature: entry.spec.default_temperature,
                default_max_tokens: entry.spec.default_max_tokens,
            }
        })
        .collect();
    Json(models)
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreated>), ApiError> {
    let model_id = request
        .model
        .unwrap_or_else(|| state.config.default_model.clone());
    let adapter = CompletionAdapter::new(&model_id, &state.catalog, &state.credentials)?;

    let context_length = adapter.model().spec.context_length;
    let ceiling = available_tokens(
        context_length,
        request.memory_tokens.or(state.config.memory_tokens),
    )
    .max(MIN_MEMORY_TOKENS);
    let memory = ConversationMemory::new(state.counter.clone(), ceiling);

    let session = ChatSession::new(adapter, memory, request.settings)?;
    let token_usage = session.memory().token_usage();
    let session_id = state.sessions.insert(session).await;

    tracing::info!("Created session {} with {}", session_id, model_id);

    Ok((
        StatusCode::CREATED,
        Json(SessionCreated {
            session_id,
            model: model_id,
            token_usage,
        }),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .sessions
        .lock(&id)
        .await
        .ok_or(ApiError::SessionNotFound(id))??;

    let messages = session
        .memory()
        .messages()
        .iter()
        .map(|m| match m.role {
            Role::Assistant => {
                let (thinking, content) = split_thinking(&m.content);
                MessageView {
                    role: m.role,
                    thinking,
                    content,
                }
            }
            _ => MessageView {
                role: m.role,
                thinking: None,
                content: m.content.clone(),
            },
        })
        .collect();

    Ok(Json(SessionView {
        session_id: id,
        model: session.model().id.clone(),
        created_at: session.created_at(),
        settings: session.settings().clone(),
        messages,
        token_usage: session.memory().token_usage(),
    }))
}

/// Submit a prompt and stream the render events back
async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SubmitRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".into()));
    }

    let mut session = state
        .sessions
        .lock(&id)
        .await
        .ok_or(ApiError::SessionNotFound(id))??;
    if !session.memory().can_hold(&Message::user(request.content.trim())) {
        return Err(ApiError::BadRequest(format!(
            "content does not fit in the {} token conversation memory",
            session.memory().max_tokens()
        )));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<SurfaceEvent>();

    // The lock is held by the task, so the session reads as busy until the
    // generation is over even if the client disconnects
    tokio::spawn(async move {
        let mut surface = ChannelSurface::new(tx);
        let result = session.submit(&request.content, &mut surface).await;
        drop(session);
        surface.done(&result);
    });

    let events = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<Event, Infallible>(event.into_sse());
        }
    };

    Ok(Sse::new(events).keep_alive(
        KeepAlive::default()
            .text("keep-alive")
            .interval(Duration::from_secs(15)),
    ))
}

async fn clear_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let mut session = state
        .sessions
        .lock(&id)
        .await
        .ok_or(ApiError::SessionNotFound(id))??;
    session.clear_messages();
    Ok(StatusCode::NO_CONTENT)
}

async fn set_memory_limit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MemoryLimitRequest>,
) -> Result<Json<TokenUsage>, ApiError> {
    let mut session = state
        .sessions
        .lock(&id)
        .await
        .ok_or(ApiError::SessionNotFound(id))??;
    let applied = session.set_memory_limit(request.max_tokens);
    tracing::debug!("Session {} memory ceiling set to {}", id, applied);
    Ok(Json(session.memory().token_usage()))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.remove(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route(
            "/v1/sessions/:id/messages",
            post(post_message).delete(clear_messages),
        )
        .route("/v1/sessions/:id/memory", put(set_memory_limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Credentials, ModelCatalog, TokenizerKind};
    use crate::core::adapter::tests::{adapter_with, ScriptedProvider};
    use crate::core::WordCounter;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn state() -> AppState {
        AppState {
            config: Arc::new(Config {
                host: "127.0.0.1".into(),
                port: 3000,
                catalog_path: None,
                default_model: "groq/qwen-qwq-32b".into(),
                memory_tokens: Some(2000),
                tokenizer: TokenizerKind::Words,
                session_idle_secs: 3600,
            }),
            catalog: Arc::new(ModelCatalog::builtin()),
            credentials: Arc::new(Credentials::default().with("GROQ_API_KEY", "gsk_test")),
            counter: Arc::new(WordCounter),
            sessions: SessionStore::new(),
        }
    }

    async fn scripted_session(state: &AppState, chunks: &[&str]) -> Uuid {
        let provider = Arc::new(ScriptedProvider::new(chunks, false));
        let memory = ConversationMemory::new(state.counter.clone(), 1000);
        let session = ChatSession::new(adapter_with(provider), memory, GenerationSettings::default()).unwrap();
        state.sessions.insert(session).await
    }

    #[tokio::test]
    async fn test_create_session_uses_defaults() {
        let state = state();
        let (status, Json(created)) = assert_ok!(
            create_session(
                State(state.clone()),
                Json(CreateSessionRequest {
                    model: None,
                    settings: GenerationSettings::default(),
                    memory_tokens: None,
                }),
            )
            .await
        );

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.model, "groq/qwen-qwq-32b");
        assert_eq!(created.token_usage, TokenUsage { current: 0, max: 2000 });
        assert!(state.sessions.get(&created.session_id).await.is_some());
    }

    #[tokio::test]
    async fn test_create_session_errors() {
        let state = state();
        let request = |model: &str| CreateSessionRequest {
            model: Some(model.into()),
            settings: GenerationSettings::default(),
            memory_tokens: None,
        };

        let err = assert_err!(create_session(State(state.clone()), Json(request("nope/model"))).await);
        assert!(matches!(err, ApiError::Chat(ChatError::Configuration(_))));

        let err = create_session(State(state.clone()), Json(request("openrouter/deepseek/deepseek-r1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Chat(ChatError::MissingCredential { .. })));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn test_post_message_streams_events_and_commits() {
        let state = state();
        let id = scripted_session(&state, &["<think>short</think>", "Hello there"]).await;

        let sse = post_message(
            State(state.clone()),
            Path(id),
            Json(SubmitRequest { content: "hi".into() }),
        )
        .await
        .unwrap();
        let body = axum::body::to_bytes(sse.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        let events: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("event:"))
            .map(str::trim)
            .collect();
        for name in ["placeholder", "thinking", "answer", "metrics", "input", "done"] {
            assert!(events.contains(&name), "missing {} in {:?}", name, events);
        }
        assert_eq!(events.last(), Some(&"done"));
        assert!(body.contains(r#""outcome":"committed""#));

        let Json(view) = assert_ok!(get_session(State(state.clone()), Path(id)).await);
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[1].thinking.as_deref(), Some("short"));
        assert_eq!(view.messages[1].content, "Hello there");
    }

    #[tokio::test]
    async fn test_busy_and_missing_sessions() {
        let state = state();
        let id = scripted_session(&state, &["ok"]).await;

        let _guard = state.sessions.lock(&id).await.unwrap().unwrap();
        let result = post_message(
            State(state.clone()),
            Path(id),
            Json(SubmitRequest { content: "hi".into() }),
        )
        .await;
        match result {
            Err(err) => assert_eq!(err.into_response().status(), StatusCode::CONFLICT),
            Ok(_) => panic!("expected the busy session to be rejected"),
        }

        let missing = Uuid::new_v4();
        let err = clear_messages(State(state.clone()), Path(missing)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = delete_session(State(state.clone()), Path(missing)).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_oversized_message_is_bad_request() {
        let state = state();
        let id = scripted_session(&state, &["ok"]).await;

        let content = vec!["word"; 1200].join(" ");
        let result = post_message(State(state.clone()), Path(id), Json(SubmitRequest { content })).await;
        match result {
            Err(err) => assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST),
            Ok(_) => panic!("expected the oversized message to be rejected"),
        }

        // Rejected before the session was touched
        assert!(matches!(state.sessions.lock(&id).await, Some(Ok(_))));
        let Json(view) = assert_ok!(get_session(State(state.clone()), Path(id)).await);
        assert!(view.messages.is_empty());
    }

    #[tokio::test]
    async fn test_blank_message_is_bad_request() {
        let state = state();
        let id = scripted_session(&state, &["ok"]).await;
        let result = post_message(
            State(state.clone()),
            Path(id),
            Json(SubmitRequest { content: "  ".into() }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_memory_limit_is_clamped() {
        let state = state();
        let id = scripted_session(&state, &[]).await;

        let Json(usage) = set_memory_limit(
            State(state.clone()),
            Path(id),
            Json(MemoryLimitRequest { max_tokens: 5 }),
        )
        .await
        .unwrap();
        assert_eq!(usage.max, MIN_MEMORY_TOKENS);

        let Json(usage) = set_memory_limit(
            State(state.clone()),
            Path(id),
            Json(MemoryLimitRequest { max_tokens: usize::MAX }),
        )
        .await
        .unwrap();
        assert_eq!(usage.max, 128_000);
    }

    #[tokio::test]
    async fn test_list_models_reports_availability() {
        let Json(models) = list_models(State(state())).await;
        let by_id = |id: &str| models.iter().find(|m| m.id == id).unwrap();

        assert!(by_id("groq/qwen-qwq-32b").available);
        assert!(!by_id("deepseek-ai/deepseek-r1").available);
        assert!(by_id("ollama/llama3.2").available);
        assert_eq!(by_id("groq/qwen-qwq-32b").context_length, 128_000);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let state = state();
        let id = scripted_session(&state, &[]).await;
        assert_eq!(
            delete_session(State(state.clone()), Path(id)).await.unwrap(),
            StatusCode::NO_CONTENT
        );
        assert_eq!(state.sessions.len().await, 0);
    }
}
