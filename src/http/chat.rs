use crate::chat::{self, ChatEvent, ChatRequest, RequestContext};
use crate::error::Result;
use crate::http::extract::{caller_key, require_login_if_configured, sees_private_content, ClientIp, OptionalAuthUser};
use crate::http::AppState;
use crate::retrieval::{build_filter, ContentAccess};
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

const EVENT_BUFFER: usize = 64;

/// `POST /api/chat`: validate, rate limit and filter up front so those
/// failures are plain JSON errors, then stream the answer as events.
pub async fn chat(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    OptionalAuthUser(user): OptionalAuthUser,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    require_login_if_configured(&state, &user)?;
    let chat = chat::validate(request, &state.config)?;

    let key = caller_key(user.as_ref(), &ClientIp(ip.clone()));
    state.enforce_limit(&state.chat_limit(), &key, ip.clone()).await?;

    let access = ContentAccess {
        private_libraries: sees_private_content(&state, user.as_ref()),
    };
    let filter = build_filter(&state.config.site, chat.collection.as_deref(), &chat.media_types, access)?;

    log::info!(
        "Chat request from {} (collection: {}, sources: {})",
        key,
        chat.collection.as_deref().unwrap_or("all"),
        chat.source_count
    );

    let ctx = RequestContext {
        client_ip: ip,
        user_id: user.map(|u| u.user_id),
    };
    let (tx, rx) = mpsc::channel::<ChatEvent>(EVENT_BUFFER);
    let service = state.chat.clone();
    tokio::spawn(async move { service.run(chat, filter, ctx, tx).await });

    let stream = ReceiverStream::new(rx).map(|event| {
        std::result::Result::<Event, Infallible>::Ok(Event::default().data(event.to_json().to_string()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")))
}
