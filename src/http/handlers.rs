//! Route handlers for the External Interfaces table (§6). Each handler
//! resolves `(service, family)` from the route/body, admits the
//! request into the `RequestQueue`, runs the mutator pipeline against
//! whichever key the queue hands back, and relays the upstream
//! response — decoding and re-transforming SSE live when the caller
//! asked to stream, or awaiting and returning the full JSON body
//! otherwise. On the way out it increments key/user usage counters,
//! fires a prompt-log entry, and (for a 429) requeues against a fresh
//! key up to `MAX_RATE_LIMIT_RETRIES` times before surfacing the error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ClassifiedError;
use crate::family::{self, ModelFamily, Service};
use crate::keypool::Key;
use crate::mutate::{run_pipeline, MutatorContext, ProxyReqManager};
use crate::promptlog::{self, PromptLogEntry};
use crate::queue::{Admission, Shard};
use crate::sse::aggregate::{Aggregator, EgressShape};
use crate::sse::decode::Decoder;
use crate::sse::Dialect;
use crate::userstore::{IpAdmission, UserType};

use super::AppState;

/// Only rate-limit-triggered retries are automatic, and only up to
/// this many (§5 "Retries").
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

fn user_token(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| Uuid::parse_str(token).ok())
}

/// `X-Forwarded-For`'s first hop if present (the usual reverse-proxy
/// convention), else the TCP peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

impl IntoResponse for ClassifiedError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_http_body())).into_response()
    }
}

/// Everything resolved once, up front, that stays constant across
/// rate-limit retries of the same logical request.
struct RequestContext {
    shard: Shard,
    user_type: UserType,
    user_token: Option<Uuid>,
    prompt_tokens: u64,
    prompt_text: String,
}

/// Resolves the caller (auth, IP cap), classifies the model family,
/// and checks quota — all before anything touches the queue or the key
/// pool, so a quota-exhausted or disabled-user request never consumes
/// a key (§4.2 "Selection failures", §7 "Quota").
async fn resolve(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    peer: SocketAddr,
    service: Service,
    model_id: &str,
    dialect: Dialect,
    body: &Value,
) -> Result<RequestContext, ClassifiedError> {
    let family = family::classify(service, model_id);
    let shard = Shard { service, family };
    let prompt_text = extract_prompt_text(dialect, body);
    let prompt_tokens = state.tokenizer.count(service, family, &prompt_text).await;

    let token = user_token(headers);
    let user_type = match token {
        Some(token) => {
            let user = state
                .users
                .get(token)
                .await
                .ok_or_else(|| ClassifiedError::account_disabled("unknown user token"))?;
            if user.is_disabled() {
                return Err(ClassifiedError::account_disabled(
                    user.disabled_reason.clone().unwrap_or_default(),
                ));
            }

            let ip = client_ip(headers, peer);
            if state.users.record_ip(token, &ip, state.settings.max_ips_per_user).await
                == IpAdmission::CapExceeded
            {
                return Err(ClassifiedError::account_disabled("IP address limit exceeded"));
            }

            if let Some(remaining) = user.quota_remaining(family) {
                if prompt_tokens > remaining {
                    let quota = user.token_limits.get(&family).copied().unwrap_or(0);
                    let used = user.token_counts.get(&family).copied().unwrap_or(0);
                    return Err(crate::error::ClassifiedError::quota_exceeded_with_detail(
                        quota,
                        used,
                        prompt_tokens,
                    ));
                }
            }
            user.user_type
        }
        None => UserType::Normal,
    };

    Ok(RequestContext {
        shard,
        user_type,
        user_token: token,
        prompt_tokens,
        prompt_text,
    })
}

/// Admits onto the queue, waits for a key, and runs the mutator
/// pipeline against it. Separate from `resolve` so a 429 retry can
/// call this again (fresh key, reverted request) without repeating
/// auth/quota resolution.
async fn admit_and_mutate(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    req: &mut ProxyReqManager,
    is_streaming: bool,
) -> Result<Arc<Key>, ClassifiedError> {
    let admission = state
        .queue
        .admit(
            ctx.shard,
            ctx.user_type,
            is_streaming,
            || tracing::debug!(shard = ?ctx.shard, "heartbeat"),
            std::future::pending::<()>(),
        )
        .await;

    let key = match admission {
        Admission::Key(key) => key,
        Admission::ShuttingDown => {
            return Err(ClassifiedError::internal("server is shutting down"));
        }
        Admission::NoAvailableKey => return Err(ClassifiedError::no_available_key()),
    };

    let mutator_ctx = MutatorContext {
        service: ctx.shard.service,
        family: ctx.shard.family,
        key: &key,
        user_quota_remaining: None,
        allowed_origin: true,
        max_completions: Some(1),
    };

    if let Err(e) = run_pipeline(&state.pipeline, req, &mutator_ctx) {
        req.revert_all();
        return Err(e);
    }
    Ok(key)
}

/// Sends `req` upstream once, classifying a non-2xx response. On a
/// 429 the key is marked rate-limited but the caller decides whether
/// to retry; on 401/403 the key is disabled outright since the
/// credential itself is bad, not merely rate-limited.
async fn send_once(
    state: &Arc<AppState>,
    key: &Key,
    req: &ProxyReqManager,
) -> Result<reqwest::Response, ClassifiedError> {
    let mut builder = state.http_client.post(&req.url);
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .json(&req.body)
        .timeout(Duration::from_millis(state.settings.upstream_timeout_ms))
        .send()
        .await
        .map_err(|e| ClassifiedError::internal(e.to_string()))?;

    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        429 => {
            state.pool.mark_rate_limited(key).await;
            let body_text = response.text().await.unwrap_or_default();
            Err(ClassifiedError::from_upstream_status(429, &body_text))
        }
        401 | 403 => {
            let body_text = response.text().await.unwrap_or_default();
            state.pool.disable(key, format!("upstream {status}: {body_text}")).await;
            Err(ClassifiedError::from_upstream_status(status, &body_text))
        }
        _ => {
            let body_text = response.text().await.unwrap_or_default();
            Err(ClassifiedError::from_upstream_status(status, &body_text))
        }
    }
}

/// Records usage against both the key and the user (§3, §8 "Quota
/// honesty"), and fires the prompt log, for one completed request.
async fn account_usage(
    state: &Arc<AppState>,
    key: &Key,
    ctx: &RequestContext,
    completion_text: &str,
    response_text: String,
) {
    let completion_tokens = state
        .tokenizer
        .count(ctx.shard.service, ctx.shard.family, completion_text)
        .await;
    let total = ctx.prompt_tokens + completion_tokens;

    state.pool.increment_usage(key, ctx.shard.family, total).await;
    if let Some(token) = ctx.user_token {
        state.users.record_usage(token, ctx.shard.family, total).await;
    }

    if state.settings.prompt_logging {
        promptlog::log_fire_and_forget(
            Arc::clone(&state.prompt_log),
            PromptLogEntry {
                request_id: Uuid::new_v4(),
                user_token: ctx.user_token.unwrap_or_default(),
                service: ctx.shard.service,
                family: ctx.shard.family,
                prompt: ctx.prompt_text.clone(),
                response: response_text,
            },
        );
    }
}

/// Pulls the text that matters for tokenization/logging out of a
/// dialect-specific inbound body: `messages` for chat dialects,
/// `prompt` for text/legacy-completion dialects.
fn extract_prompt_text(dialect: Dialect, body: &Value) -> String {
    match dialect {
        Dialect::OpenAiChat | Dialect::AnthropicChat => body
            .get("messages")
            .and_then(Value::as_array)
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| m.get("content").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
        _ => body
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default(),
    }
}

/// Pulls the generated text back out of a non-streaming upstream
/// response body, for completion-token counting and prompt logging.
fn extract_completion_text(dialect: Dialect, body: &Value) -> String {
    match dialect {
        Dialect::OpenAiChat => body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        Dialect::AnthropicV1 | Dialect::AnthropicV2 | Dialect::AnthropicChat => {
            body["completion"].as_str().unwrap_or_default().to_string()
        }
        _ => body["choices"][0]["text"].as_str().unwrap_or_default().to_string(),
    }
}

/// Non-streaming path: send the request, await the full JSON body,
/// retrying up to `MAX_RATE_LIMIT_RETRIES` times on a 429 against a
/// freshly-admitted key.
async fn dispatch_json(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    peer: SocketAddr,
    service: Service,
    model_id: &str,
    body: Value,
    url: String,
    dialect: Dialect,
) -> Result<Value, ClassifiedError> {
    let ctx = resolve(state, headers, peer, service, model_id, dialect, &body).await?;
    let mut req = ProxyReqManager::new(url, HashMap::new(), body);

    let mut attempt = 0;
    loop {
        let key = admit_and_mutate(state, &ctx, &mut req, false).await?;
        match send_once(state, &key, &req).await {
            Ok(response) => {
                let content_encoding = response
                    .headers()
                    .get("content-encoding")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ClassifiedError::internal(e.to_string()))?;
                let decoded = crate::decompress::decode(content_encoding.as_deref(), &bytes)
                    .map_err(|e| ClassifiedError::internal(e.to_string()))?;
                let parsed: Value =
                    serde_json::from_slice(&decoded).map_err(|e| ClassifiedError::internal(e.to_string()))?;

                let completion_text = extract_completion_text(dialect, &parsed);
                account_usage(state, &key, &ctx, &completion_text, parsed.to_string()).await;
                return Ok(parsed);
            }
            Err(e) if e.kind == crate::error::ErrorKind::ProxyQuotaExceeded && attempt < MAX_RATE_LIMIT_RETRIES => {
                attempt += 1;
                req.revert_all();
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Streaming path: send the request, relay the upstream SSE body live,
/// decoding and re-transforming each event into the canonical dialect
/// on the way through (§4.3/§4.4), while an `Aggregator` accumulates
/// the canonical events so usage accounting and prompt logging can run
/// once the stream ends, exactly as the blocking path does (§4.4). A
/// mid-stream upstream failure is folded into a fake SSE error frame
/// rather than severing the connection, per §4.6a. A pre-flight 429 is
/// retried, same as the blocking path; once bytes have started
/// streaming to the client a retry is no longer possible, so a 429
/// surfacing after that point becomes a fake error frame instead.
async fn dispatch_stream(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    peer: SocketAddr,
    service: Service,
    model_id: &str,
    body: Value,
    url: String,
    from_dialect: Dialect,
    egress_shape: EgressShape,
) -> Result<Response, ClassifiedError> {
    let ctx = resolve(state, headers, peer, service, model_id, from_dialect, &body).await?;
    let mut req = ProxyReqManager::new(url, HashMap::new(), body);

    let (key, response) = {
        let mut attempt = 0;
        loop {
            let key = admit_and_mutate(state, &ctx, &mut req, true).await?;
            match send_once(state, &key, &req).await {
                Ok(response) => break (key, response),
                Err(e) if e.kind == crate::error::ErrorKind::ProxyQuotaExceeded && attempt < MAX_RATE_LIMIT_RETRIES => {
                    attempt += 1;
                    req.revert_all();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    };

    let state = Arc::clone(state);
    let mut upstream = response.bytes_stream();
    let mut decoder = Decoder::new();
    let mut transformer = crate::sse::transform::Transformer::new(from_dialect, Dialect::OpenAiChat);
    let mut aggregator = Aggregator::new(egress_shape);

    let relayed = async_stream::stream! {
        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    for event in decoder.push(&chunk) {
                        let transformed = transformer.transform(event);
                        aggregator.push(&transformed);
                        yield Ok::<_, std::io::Error>(bytes::Bytes::from(transformed.to_wire()));
                    }
                }
                Some(Err(e)) => {
                    let classified = ClassifiedError::internal(e.to_string());
                    yield Ok(bytes::Bytes::from(classified.to_sse_frame()));
                    yield Ok(bytes::Bytes::from("data: [DONE]\n\n"));
                    break;
                }
                None => {
                    if let Some(event) = decoder.finish() {
                        let transformed = transformer.transform(event);
                        aggregator.push(&transformed);
                        yield Ok(bytes::Bytes::from(transformed.to_wire()));
                    }
                    break;
                }
            }
        }

        let final_response = aggregator.finish();
        let completion_text = extract_completion_text(Dialect::OpenAiChat, &final_response);
        account_usage(&state, &key, &ctx, &completion_text, final_response.to_string()).await;
    };

    Ok((
        StatusCode::OK,
        [
            ("content-type", "text/event-stream"),
            ("cache-control", "no-cache"),
            ("connection", "keep-alive"),
            ("x-accel-buffering", "no"),
        ],
        Body::from_stream(relayed),
    )
        .into_response())
}

pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let all_families = [
        (Service::OpenAi, ModelFamily::Turbo),
        (Service::OpenAi, ModelFamily::Gpt4),
        (Service::OpenAi, ModelFamily::Gpt4Turbo),
        (Service::OpenAi, ModelFamily::DallE),
        (Service::Anthropic, ModelFamily::Claude),
        (Service::Aws, ModelFamily::AwsClaude),
        (Service::Google, ModelFamily::Bison),
        (Service::Mistral, ModelFamily::MistralLarge),
    ];
    let allowed = state.settings.allowed_model_families.as_ref();
    let data: Vec<Value> = all_families
        .iter()
        .filter(|(_, family)| allowed.map(|a| a.contains(family)).unwrap_or(true))
        .map(|(service, family)| {
            serde_json::json!({
                "id": family.to_string(),
                "object": "model",
                "available_keys": state.pool.available(*service, *family),
            })
        })
        .collect();
    Json(serde_json::json!({ "object": "list", "data": data }))
}

#[allow(clippy::too_many_arguments)]
async fn relay(
    state: Arc<AppState>,
    headers: HeaderMap,
    peer: SocketAddr,
    service: Service,
    body: Value,
    url: String,
    from_dialect: Dialect,
    egress_shape: EgressShape,
) -> Response {
    let model_id = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if is_streaming {
        match dispatch_stream(
            &state,
            &headers,
            peer,
            service,
            &model_id,
            body,
            url,
            from_dialect,
            egress_shape,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    } else {
        match dispatch_json(&state, &headers, peer, service, &model_id, body, url, from_dialect).await {
            Ok(v) => Json(v).into_response(),
            Err(e) => e.into_response(),
        }
    }
}

pub async fn openai_chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    relay(
        state,
        headers,
        peer,
        Service::OpenAi,
        body,
        "https://api.openai.com/v1/chat/completions".to_string(),
        Dialect::OpenAiChat,
        EgressShape::ChatReduce,
    )
    .await
}

pub async fn openai_text_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    relay(
        state,
        headers,
        peer,
        Service::OpenAi,
        body,
        "https://api.openai.com/v1/completions".to_string(),
        Dialect::OpenAiText,
        EgressShape::TextConcatenate,
    )
    .await
}

/// `/v1/turbo-instruct/(v1/)?chat/completions`: accepts either `prompt`
/// or `messages` in an otherwise chat-shaped body, rewrites onto the
/// legacy `/v1/completions` URL, and always egresses `openai-text`
/// (§6 route table).
pub async fn turbo_instruct_chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    let from_dialect = if body.get("messages").is_some() {
        let prompt = extract_prompt_text(Dialect::OpenAiChat, &body);
        if let Some(obj) = body.as_object_mut() {
            obj.remove("messages");
            obj.insert("prompt".to_string(), Value::String(prompt));
        }
        Dialect::OpenAiChat
    } else {
        Dialect::OpenAiText
    };

    relay(
        state,
        headers,
        peer,
        Service::OpenAi,
        body,
        "https://api.openai.com/v1/completions".to_string(),
        from_dialect,
        EgressShape::TextConcatenate,
    )
    .await
}

pub async fn openai_embeddings(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let model_id = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    match dispatch_json(
        &state,
        &headers,
        peer,
        Service::OpenAi,
        &model_id,
        body,
        "https://api.openai.com/v1/embeddings".to_string(),
        Dialect::OpenAiChat,
    )
    .await
    {
        Ok(v) => Json(v).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn openai_images(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    // finalizeBody strips `stream` for the images route — image
    // generation has no streaming dialect of its own (§6 route table).
    if let Some(obj) = body.as_object_mut() {
        obj.remove("stream");
    }
    match dispatch_json(
        &state,
        &headers,
        peer,
        Service::OpenAi,
        "dall-e-3",
        body,
        "https://api.openai.com/v1/images/generations".to_string(),
        Dialect::OpenAiText,
    )
    .await
    {
        Ok(v) => Json(v).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn anthropic_complete(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    relay(
        state,
        headers,
        peer,
        Service::Anthropic,
        body,
        "https://api.anthropic.com/v1/complete".to_string(),
        Dialect::AnthropicV1,
        EgressShape::AnthropicVerbatim {
            log_id: Uuid::new_v4().to_string(),
        },
    )
    .await
}

pub async fn mistral_chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    relay(
        state,
        headers,
        peer,
        Service::Mistral,
        body,
        "https://api.mistral.ai/v1/chat/completions".to_string(),
        Dialect::OpenAiChat,
        EgressShape::ChatReduce,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_ip_prefers_forwarded_for_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "203.0.113.9");
    }

    #[test]
    fn client_ip_falls_back_to_peer_without_forwarded_header() {
        let headers = HeaderMap::new();
        let peer: SocketAddr = "198.51.100.4:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "198.51.100.4");
    }

    #[test]
    fn extract_prompt_text_joins_chat_messages() {
        let body = json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
        ]});
        assert_eq!(extract_prompt_text(Dialect::OpenAiChat, &body), "hi\nhello");
    }

    #[test]
    fn extract_prompt_text_reads_legacy_prompt_field() {
        let body = json!({"prompt": "continue this"});
        assert_eq!(extract_prompt_text(Dialect::OpenAiText, &body), "continue this");
    }

    #[test]
    fn extract_completion_text_reads_chat_message_content() {
        let body = json!({"choices": [{"message": {"content": "the answer"}}]});
        assert_eq!(extract_completion_text(Dialect::OpenAiChat, &body), "the answer");
    }

    #[test]
    fn extract_completion_text_reads_anthropic_completion_field() {
        let body = json!({"completion": "bonjour"});
        assert_eq!(extract_completion_text(Dialect::AnthropicV1, &body), "bonjour");
    }
}
