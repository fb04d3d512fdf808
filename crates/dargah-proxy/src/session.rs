//! Per-client session pipeline.
//!
//! Admission first: read the startup message, pull out the bearer token,
//! authenticate, rewrite the startup without the token, pick an upstream
//! and acquire a pooled backend connection. Then two sibling tasks relay
//! traffic — frontend (client → backend) inspecting and authorizing every
//! frame, backend (backend → client) forwarding opaquely. The session ends
//! when either direction does; the backend connection goes back to its
//! pool and the audit record is handed off.

use crate::audit::{AuditSink, SessionRecord, SqlDraft};
use crate::auth::{self, AuthenticatedUser};
use crate::classify::{classify, QueryClass};
use crate::metrics;
use crate::pg_wire::codec::{encode_frame, read_cstr, read_frame, CodecError};
use crate::pg_wire::messages::{
    decode_bind, decode_parse, decode_simple_query, encode_error, encode_ready_for_query,
    materialize_sql, BindValue,
};
use crate::pg_wire::startup::{self, StartupMessage};
use crate::pool::PoolError;
use crate::router::Router;
use crate::upstream::Upstream;
use chrono::Utc;
use dargah_common::Role;
use dargah_store::users::UserStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared dependencies handed to every session.
pub struct SessionContext {
    pub jwt_secret: String,
    pub max_frame_size: usize,
    pub acquire_timeout: Duration,
    pub users: UserStore,
    pub router: Arc<Router>,
    pub audit: AuditSink,
    pub cancel: CancellationToken,
}

/// Run one client session to completion. Errors never escape to the accept
/// loop; everything is translated to wire errors or logged here.
pub async fn handle_session(ctx: Arc<SessionContext>, client: TcpStream, conn_id: u64) {
    metrics::CLIENT_CONNECTIONS_TOTAL.inc();
    metrics::ACTIVE_SESSIONS.inc();
    let outcome = run_session(&ctx, client, conn_id).await;
    metrics::ACTIVE_SESSIONS.dec();
    if let Err(err) = outcome {
        debug!(conn_id, error = %err, "session ended with error");
    }
}

async fn run_session(
    ctx: &Arc<SessionContext>,
    mut client: TcpStream,
    conn_id: u64,
) -> anyhow::Result<()> {
    // ── Phase A: admission ──────────────────────────────────────────────

    let startup = match read_client_startup(ctx, &mut client, conn_id).await? {
        Some(startup) => startup,
        None => return Ok(()),
    };

    let params = match startup.parameters() {
        Ok(params) => params,
        Err(err) => {
            warn!(conn_id, error = %err, "malformed startup parameters");
            send_frame(
                &mut client,
                &encode_error("FATAL", "08P01", "malformed startup message"),
            )
            .await?;
            return Ok(());
        }
    };

    let Some(token) = params
        .iter()
        .find(|(key, _)| key == startup::TOKEN_PARAMETER)
        .map(|(_, value)| value.clone())
    else {
        send_frame(
            &mut client,
            &encode_error("FATAL", "28000", "missing token startup parameter"),
        )
        .await?;
        return Ok(());
    };

    let user = match auth::validate(&token, &ctx.jwt_secret, &ctx.users).await {
        Ok(user) => user,
        Err(err) => {
            info!(conn_id, error = %err, "rejecting client");
            send_frame(
                &mut client,
                &encode_error("FATAL", err.sqlstate(), &err.to_string()),
            )
            .await?;
            return Ok(());
        }
    };

    let rewritten = startup::rewrite_without_token(&params);

    let Some(upstream) = ctx.router.next_healthy() else {
        let message = if ctx.cancel.is_cancelled() {
            "proxy is shutting down"
        } else {
            "no healthy upstream available"
        };
        send_frame(&mut client, &encode_error("FATAL", "08006", message)).await?;
        return Ok(());
    };

    let backend = match upstream.pool.acquire(ctx.acquire_timeout, &ctx.cancel).await {
        Ok(backend) => backend,
        Err(err) => {
            warn!(conn_id, upstream = %upstream.addr, error = %err, "backend acquisition failed");
            let code = match err {
                PoolError::Closed => "08006",
                _ => "08001",
            };
            send_frame(
                &mut client,
                &encode_error("FATAL", code, &format!("cannot connect to backend: {err}")),
            )
            .await?;
            return Ok(());
        }
    };

    info!(
        conn_id,
        user = %user.username,
        role = %user.role,
        upstream = %upstream.addr,
        "session established"
    );

    relay(ctx, client, backend, upstream, user, conn_id, rewritten).await
}

/// Read startup-family messages until a normal startup arrives. SSLRequest
/// gets a single `N`; CancelRequest and GSSENCRequest get an error frame
/// and `Ok(None)` (close).
async fn read_client_startup(
    ctx: &SessionContext,
    client: &mut TcpStream,
    conn_id: u64,
) -> anyhow::Result<Option<StartupMessage>> {
    loop {
        let message = match startup::read_startup(client, ctx.max_frame_size).await {
            Ok(message) => message,
            Err(CodecError::ShortRead) => return Ok(None),
            Err(err) => {
                warn!(conn_id, error = %err, "bad startup frame");
                return Ok(None);
            }
        };

        if message.is_ssl_request() {
            debug!(conn_id, "SSL negotiation requested, declining");
            client.write_all(b"N").await?;
            client.flush().await?;
            continue;
        }
        if message.is_cancel_request() || message.is_gssenc_request() {
            debug!(conn_id, code = message.code, "unsupported negotiation request");
            send_frame(
                client,
                &encode_error("FATAL", "0A000", "request not supported by proxy"),
            )
            .await?;
            return Ok(None);
        }
        if message.is_startup() {
            return Ok(Some(message));
        }

        warn!(conn_id, code = message.code, "unknown startup protocol");
        send_frame(
            client,
            &encode_error("FATAL", "08P01", "unsupported protocol version"),
        )
        .await?;
        return Ok(None);
    }
}

/// Phases B and C: write the rewritten startup upstream, then relay both
/// directions until one ends.
async fn relay(
    ctx: &Arc<SessionContext>,
    client: TcpStream,
    mut backend: TcpStream,
    upstream: Arc<Upstream>,
    user: AuthenticatedUser,
    conn_id: u64,
    rewritten_startup: Vec<u8>,
) -> anyhow::Result<()> {
    let request_id = Uuid::new_v4().to_string();
    let created_at = Utc::now();

    if let Err(err) = backend.write_all(&rewritten_startup).await {
        warn!(conn_id, error = %err, "failed to forward startup upstream");
        upstream.pool.release(backend);
        return Err(err.into());
    }

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();
    let client_write = Arc::new(Mutex::new(client_write));
    let session_cancel = ctx.cancel.child_token();

    let mut frontend_task = tokio::spawn(frontend(
        BufReader::new(client_read),
        backend_write,
        client_write.clone(),
        user.role,
        ctx.max_frame_size,
        session_cancel.clone(),
        conn_id,
    ));
    let mut backend_task = tokio::spawn(backend_relay(
        BufReader::new(backend_read),
        client_write,
        ctx.max_frame_size,
        session_cancel.clone(),
        conn_id,
    ));

    let (frontend_out, backend_out) = tokio::select! {
        out = &mut frontend_task => {
            session_cancel.cancel();
            (out, backend_task.await)
        }
        out = &mut backend_task => {
            session_cancel.cancel();
            (frontend_task.await, out)
        }
    };

    let mut sqls = Vec::new();
    let mut backend_write = None;
    if let Ok((write_half, drafts)) = frontend_out {
        sqls = drafts;
        backend_write = Some(write_half);
    }
    let backend_read = backend_out.ok();

    // reunite the halves and give the connection back to the pool
    match (backend_read, backend_write) {
        (Some(read_half), Some(write_half)) => match read_half.reunite(write_half) {
            Ok(stream) => upstream.pool.release(stream),
            Err(err) => warn!(conn_id, error = %err, "failed to reunite backend halves"),
        },
        _ => debug!(conn_id, "backend connection dropped with the session"),
    }

    info!(conn_id, statements = sqls.len(), "session closed");

    ctx.audit.submit(SessionRecord {
        request_id,
        user_id: user.id,
        conn_id,
        server_addr: Some(upstream.addr.clone()),
        created_at,
        completed_at: Some(Utc::now()),
        sqls,
    });

    Ok(())
}

/// Client → backend. Inspects every frame, maintains extended-protocol
/// state, enforces RBAC, collects the audit trail.
async fn frontend(
    mut client_read: BufReader<OwnedReadHalf>,
    mut backend_write: OwnedWriteHalf,
    client_write: Arc<Mutex<OwnedWriteHalf>>,
    role: Role,
    max_frame_size: usize,
    cancel: CancellationToken,
    conn_id: u64,
) -> (OwnedWriteHalf, Vec<SqlDraft>) {
    // prepared statements by name; the empty name is the unnamed statement
    let mut statements: HashMap<String, String> = HashMap::new();
    // portals by name: which statement they bind and with which parameters
    let mut portals: HashMap<String, Vec<BindValue>> = HashMap::new();
    let mut portal_statements: HashMap<String, String> = HashMap::new();
    let mut drafts: Vec<SqlDraft> = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut client_read, max_frame_size) => frame,
        };
        let (tag, payload) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(conn_id, error = %err, "error reading from client");
                break;
            }
        };

        match tag {
            b'Q' => {
                let sql = match decode_simple_query(&payload) {
                    Ok(sql) => sql,
                    Err(err) => {
                        warn!(conn_id, error = %err, "malformed simple query");
                        break;
                    }
                };
                debug!(conn_id, sql = %sql, "client query");

                let class = classify(&sql);
                metrics::record_query(class.as_str());
                let mut draft = SqlDraft::new(sql.clone(), class);

                if denied(role, class) {
                    info!(conn_id, sql = %sql, "write denied for read-only user");
                    metrics::record_rbac_denial();
                    // simple-query flow: the backend never sees the statement,
                    // so the proxy must also hand control back to the client
                    if deny_to_client(&client_write, true).await.is_err() {
                        break;
                    }
                    draft.complete();
                    drafts.push(draft);
                    continue;
                }

                if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                    drafts.push(draft);
                    break;
                }
                draft.complete();
                drafts.push(draft);
            }
            b'P' => {
                match decode_parse(&payload) {
                    Ok(parse) => {
                        debug!(conn_id, statement = %parse.statement, sql = %parse.sql, "client parse");
                        statements.insert(parse.statement, parse.sql);
                    }
                    Err(err) => warn!(conn_id, error = %err, "malformed parse message"),
                }
                if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                    break;
                }
            }
            b'B' => {
                match decode_bind(&payload) {
                    Ok(bind) => {
                        debug!(
                            conn_id,
                            portal = %bind.portal,
                            statement = %bind.statement,
                            params = bind.params.len(),
                            "client bind"
                        );
                        portal_statements.insert(bind.portal.clone(), bind.statement.clone());
                        portals.insert(bind.portal, bind.params);
                    }
                    Err(err) => warn!(conn_id, error = %err, "malformed bind message"),
                }
                if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                    break;
                }
            }
            b'E' => {
                let portal = read_cstr(&payload, 0)
                    .map(|(name, _)| name)
                    .unwrap_or_default();

                let materialized = portal_statements.get(&portal).and_then(|statement| {
                    statements.get(statement).map(|sql| {
                        let params = portals.get(&portal).map(Vec::as_slice).unwrap_or(&[]);
                        materialize_sql(sql, params)
                    })
                });

                if let Some(sql) = materialized {
                    debug!(conn_id, sql = %sql, "client execute");
                    let class = classify(&sql);
                    metrics::record_query(class.as_str());
                    let mut draft = SqlDraft::new(sql.clone(), class);

                    if denied(role, class) {
                        info!(conn_id, sql = %sql, "write denied for read-only user");
                        metrics::record_rbac_denial();
                        // extended flow: the client's Sync still reaches the
                        // backend, whose ReadyForQuery closes the cycle
                        if deny_to_client(&client_write, false).await.is_err() {
                            break;
                        }
                        draft.complete();
                        drafts.push(draft);
                        continue;
                    }

                    if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                        drafts.push(draft);
                        break;
                    }
                    draft.complete();
                    drafts.push(draft);
                } else {
                    // Execute for a portal we never saw bound; forward opaque
                    if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                        break;
                    }
                }
            }
            b'S' => {
                // Sync ends the unnamed statement and unnamed portal;
                // named statements persist across Syncs
                statements.remove("");
                portals.remove("");
                portal_statements.remove("");
                if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                    break;
                }
            }
            b'X' => {
                debug!(conn_id, "client terminate");
                let _ = forward(&mut backend_write, tag, &payload, conn_id).await;
                break;
            }
            _ => {
                // Describe, Close, password/SASL, copy traffic: forward opaque
                if forward(&mut backend_write, tag, &payload, conn_id).await.is_err() {
                    break;
                }
            }
        }
    }

    (backend_write, drafts)
}

/// Backend → client. Forwards every frame unchanged, logging by kind.
async fn backend_relay(
    mut backend_read: BufReader<OwnedReadHalf>,
    client_write: Arc<Mutex<OwnedWriteHalf>>,
    max_frame_size: usize,
    cancel: CancellationToken,
    conn_id: u64,
) -> OwnedReadHalf {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut backend_read, max_frame_size) => frame,
        };
        let (tag, payload) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(conn_id, error = %err, "error reading from backend");
                break;
            }
        };

        debug!(conn_id, kind = backend_kind(tag), len = payload.len(), "backend frame");

        let frame_bytes = encode_frame(tag, &payload);
        let mut writer = client_write.lock().await;
        if writer.write_all(&frame_bytes).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }

    backend_read.into_inner()
}

fn denied(role: Role, class: QueryClass) -> bool {
    class.is_write() && !role.can_write()
}

/// Send the insufficient_privilege error; for simple queries also a
/// ReadyForQuery so the client regains control.
async fn deny_to_client(
    client_write: &Arc<Mutex<OwnedWriteHalf>>,
    with_ready: bool,
) -> std::io::Result<()> {
    let mut writer = client_write.lock().await;
    writer
        .write_all(&encode_error(
            "ERROR",
            "42501",
            "permission denied: role is read-only",
        ))
        .await?;
    if with_ready {
        writer.write_all(&encode_ready_for_query(b'I')).await?;
    }
    writer.flush().await
}

async fn forward(
    backend_write: &mut OwnedWriteHalf,
    tag: u8,
    payload: &[u8],
    conn_id: u64,
) -> std::io::Result<()> {
    let frame = encode_frame(tag, payload);
    if let Err(err) = backend_write.write_all(&frame).await {
        warn!(conn_id, error = %err, "error forwarding to backend");
        return Err(err);
    }
    backend_write.flush().await
}

async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

fn backend_kind(tag: u8) -> &'static str {
    match tag {
        b'R' => "Authentication",
        b'C' => "CommandComplete",
        b'E' => "ErrorResponse",
        b'N' => "NoticeResponse",
        b'T' => "RowDescription",
        b'D' => "DataRow",
        b'Z' => "ReadyForQuery",
        b'S' => "ParameterStatus",
        b'K' => "BackendKeyData",
        b'1' => "ParseComplete",
        b'2' => "BindComplete",
        _ => "Opaque",
    }
}
