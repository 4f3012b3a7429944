//! Line-oriented JSON protocol over TCP.
//!
//! Each request is one JSON object on one line, tagged by `op`. Each response is one line:
//! `{"ok":true,"result":...}` or `{"ok":false,"error":{"code":...,"message":...,"retryable":...}}`.
//! After a successful `subscribe` the connection only carries `{"event":...}` lines (plus
//! `{"lagged":n}` when the subscriber fell behind) until the client hangs up.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::auth::token_matches;
use crate::engine::{Engine, EngineError};
use crate::limits::{DEFAULT_HOLD_TTL_SECS, MAX_LINE_LEN};
use crate::model::*;
use crate::notify::NotifyHub;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("framing error: {0}")]
    Codec(#[from] LinesCodecError),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        token: String,
    },
    CreateReservation(NewReservation),
    HoldReservation {
        #[serde(flatten)]
        reservation: NewReservation,
        ttl_secs: Option<u64>,
    },
    ConfirmReservation {
        booking_id: Ulid,
    },
    CancelReservation {
        booking_id: Ulid,
        requester_id: String,
    },
    GetAvailability {
        court_id: Ulid,
        date: NaiveDate,
        granularity_minutes: Option<u16>,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ListBookings {
        requester_id: Option<String>,
        court_id: Option<Ulid>,
        date: Option<NaiveDate>,
    },
    BlockWindow {
        #[serde(flatten)]
        block: NewBlock,
        requester_id: String,
    },
    UnblockWindow {
        block_id: Ulid,
        requester_id: String,
    },
    RegisterCourt {
        court: Court,
    },
    Subscribe {
        court_id: Ulid,
    },
}

impl Request {
    /// Short label for metrics.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::CreateReservation(_) => "create_reservation",
            Request::HoldReservation { .. } => "hold_reservation",
            Request::ConfirmReservation { .. } => "confirm_reservation",
            Request::CancelReservation { .. } => "cancel_reservation",
            Request::GetAvailability { .. } => "get_availability",
            Request::GetBooking { .. } => "get_booking",
            Request::ListBookings { .. } => "list_bookings",
            Request::BlockWindow { .. } => "block_window",
            Request::UnblockWindow { .. } => "unblock_window",
            Request::RegisterCourt { .. } => "register_court",
            Request::Subscribe { .. } => "subscribe",
        }
    }
}

/// A failed request as it goes on the wire.
#[derive(Debug)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl WireError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: message.into(),
            retryable: false,
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: "unauthorized",
            message: message.into(),
            retryable: false,
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "ok": false,
            "error": { "code": self.code, "message": self.message, "retryable": self.retryable },
        })
    }
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

fn ok(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

type Lines<S> = Framed<S, LinesCodec>;

pub struct Server {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    token: Option<String>,
}

impl Server {
    pub fn new(engine: Arc<Engine>, hub: Arc<NotifyHub>, token: Option<String>) -> Self {
        Self { engine, hub, token }
    }

    /// Accept connections until `shutdown` resolves, then wait up to 10s for open
    /// connections to finish.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        max_connections: usize,
        shutdown: impl Future<Output = ()>,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_connections));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (socket, peer) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("connection limit reached, rejecting {peer}");
                            metrics::counter!(crate::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                            drop(socket);
                            continue;
                        }
                    };

                    debug!("connection from {peer}");
                    metrics::counter!(crate::observability::CONNECTIONS_TOTAL).increment(1);
                    metrics::gauge!(crate::observability::CONNECTIONS_ACTIVE).increment(1.0);
                    let server = self.clone();

                    tokio::spawn(async move {
                        let _permit = permit; // held until connection closes
                        if let Err(e) = server.handle_connection(socket).await {
                            warn!("connection error from {peer}: {e}");
                        }
                        metrics::gauge!(crate::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        info!("draining connections...");
        let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(drain_deadline);

        loop {
            if semaphore.available_permits() == max_connections {
                info!("all connections drained");
                break;
            }
            tokio::select! {
                _ = &mut drain_deadline => {
                    let remaining = max_connections - semaphore.available_permits();
                    warn!("drain timeout, {remaining} connections still open");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Serve one client until it disconnects.
    pub async fn handle_connection<S>(&self, socket: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
        let mut authenticated = self.token.is_none();

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    let err = WireError {
                        code: "limit_exceeded",
                        message: format!("request line longer than {MAX_LINE_LEN} bytes"),
                        retryable: false,
                    };
                    lines.send(err.to_json().to_string()).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<Request>(&line) {
                Ok(req) => req,
                Err(e) => {
                    lines.send(WireError::bad_request(e.to_string()).to_json().to_string()).await?;
                    continue;
                }
            };
            let op = request.op();
            let started = Instant::now();

            let reply = match request {
                Request::Hello { token } => self.hello(&token, &mut authenticated),
                _ if !authenticated => Err(WireError::unauthorized("send hello with a valid token first")),
                Request::Subscribe { court_id } => match self.engine.court(court_id).await {
                    Ok(_) => {
                        // Subscribe before acknowledging so no event after the ack is missed.
                        let rx = self.hub.subscribe(court_id);
                        lines.send(ok(json!({ "court_id": court_id })).to_string()).await?;
                        record(op, "ok", started);
                        let result = stream_events(&mut lines, rx).await;
                        self.hub.prune();
                        return result;
                    }
                    Err(e) => Err(e.into()),
                },
                other => self.dispatch(other).await,
            };

            let status = if reply.is_ok() { "ok" } else { "error" };
            record(op, status, started);
            let body = match reply {
                Ok(result) => ok(result),
                Err(e) => {
                    debug!("{op} failed: {} {}", e.code, e.message);
                    e.to_json()
                }
            };
            lines.send(body.to_string()).await?;
        }
        Ok(())
    }

    fn hello(&self, presented: &str, authenticated: &mut bool) -> Result<Value, WireError> {
        match &self.token {
            Some(expected) if !token_matches(expected, presented) => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(WireError::unauthorized("invalid token"))
            }
            _ => {
                *authenticated = true;
                Ok(json!({ "authenticated": true }))
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value, WireError> {
        let engine = &self.engine;
        let value = match request {
            Request::CreateReservation(input) => json!(engine.reserve(input).await?),
            Request::HoldReservation { reservation, ttl_secs } => {
                let ttl = Duration::from_secs(ttl_secs.unwrap_or(DEFAULT_HOLD_TTL_SECS));
                json!(engine.hold(reservation, ttl).await?)
            }
            Request::ConfirmReservation { booking_id } => json!(engine.confirm(booking_id).await?),
            Request::CancelReservation { booking_id, requester_id } => {
                let outcome = engine.cancel(booking_id, &requester_id).await?;
                json!({ "booking": outcome.booking, "already_cancelled": outcome.already_cancelled })
            }
            Request::GetAvailability { court_id, date, granularity_minutes } => match granularity_minutes {
                Some(g) => json!({ "court_id": court_id, "date": date, "slots": engine.available_slots(court_id, date, g).await? }),
                None => json!({ "court_id": court_id, "date": date, "free": engine.availability(court_id, date).await? }),
            },
            Request::GetBooking { booking_id } => json!(engine.booking(booking_id).await?),
            Request::ListBookings { requester_id, court_id, date } => match (requester_id, court_id, date) {
                (Some(requester), None, None) => json!(engine.bookings_for_requester(&requester).await?),
                (None, Some(court), Some(date)) => json!(engine.bookings_for_date(court, date).await?),
                _ => return Err(WireError::bad_request("list_bookings needs requester_id, or court_id and date")),
            },
            Request::BlockWindow { block, requester_id } => json!(engine.block_window(&requester_id, block).await?),
            Request::UnblockWindow { block_id, requester_id } => {
                json!({ "removed": engine.unblock_window(&requester_id, block_id).await? })
            }
            Request::RegisterCourt { court } => {
                let id = court.id;
                engine.register_court(court).await?;
                json!({ "court_id": id })
            }
            Request::Hello { .. } | Request::Subscribe { .. } => {
                return Err(WireError::bad_request("unexpected op"));
            }
        };
        Ok(value)
    }
}

/// Forward change events until the client hangs up.
async fn stream_events<S>(lines: &mut Lines<S>, mut rx: broadcast::Receiver<ChangeEvent>) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => lines.send(json!({ "event": event }).to_string()).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    lines.send(json!({ "lagged": n }).to_string()).await?;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            incoming = lines.next() => match incoming {
                // Subscribed connections are write-only; anything the client sends is ignored.
                Some(Ok(_)) => {}
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
        }
    }
}

fn record(op: &'static str, status: &'static str, started: Instant) {
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
