//! Per-connection supervisor (spec §4.3): one task per TCP connection, owning its
//! reassembler exclusively, driving decode → authorize → ACK → command-drain → forward.
//!
//! Grounded on the teacher's `teltonika::connection` module: the `log!(target: &imei, ...)`
//! idiom for per-device log correlation, and a `loop { match read().await { Ok(..) =>
//! .., Err(..) => match err.kind() { .. } } }` read loop that distinguishes a clean
//! disconnect from a malformed frame from a fatal I/O error.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::framing::{reassembler_for, FrameOutcome};
use crate::listener::Protocol;
use crate::presence::command_queue::CommandQueue;
use crate::presence::PresenceStore;
use crate::protocol::{gt06, teltonika, CodecError, DecodedPacket, Payload};
use crate::utils::config::Config;
use crate::webhook::WebhookSink;

/// Connection is force-closed after this many consecutive frames fail to decode, rather
/// than resyncing indefinitely against a device stuck sending garbage (spec §7).
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 3;
const READ_CHUNK_SIZE: usize = 4096;

pub struct ConnectionDeps {
    pub presence: PresenceStore,
    pub commands: CommandQueue,
    pub webhook: WebhookSink,
    pub config: Config,
}

/// Drives one accepted socket to completion. Consumes the socket; returns once the
/// connection is closed, for any reason, after transitioning the device (if any logged in)
/// to DISCONNECTED (spec §3, §7: every socket close/error updates DeviceStatus).
pub async fn handle_connection(mut socket: TcpStream, protocol: Protocol, deps: Arc<ConnectionDeps>) {
    let imei = run_session(&mut socket, protocol, &deps).await;
    if let Some(imei) = imei
        && let Err(err) = deps.presence.mark_disconnected(&imei).await
    {
        warn!(target: &imei, "failed to mark device disconnected: {:?}", err);
    }
}

/// Runs the read/decode/dispatch loop until the connection ends, returning the bound IMEI
/// (if the device ever logged in) so the caller can update its presence.
async fn run_session(socket: &mut TcpStream, protocol: Protocol, deps: &Arc<ConnectionDeps>) -> Option<String> {
    let mut reassembler = reassembler_for(protocol);
    let mut imei: Option<String> = None;
    let mut consecutive_errors = 0u32;
    let mut read_buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        // Before login, a device has only `con_timeout` to send its first frame; once
        // authenticated, the looser `socket_timeout` idle deadline applies (spec §6).
        let deadline = if imei.is_some() { deps.config.socket_timeout } else { deps.config.con_timeout };
        let read_result = timeout(deadline, socket.read(&mut read_buf)).await;
        let n = match read_result {
            Ok(Ok(0)) => {
                info!(target: log_target(&imei), "client disconnected");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                warn!(target: log_target(&imei), "socket read error: {}", err);
                break;
            }
            Err(_) => {
                info!(target: log_target(&imei), "idle timeout, closing connection");
                break;
            }
        };

        reassembler.append(&read_buf[..n]);

        loop {
            match reassembler.try_take_frame() {
                FrameOutcome::Frame(frame) => {
                    match decode(&frame, protocol, &deps.config) {
                        Ok(packet) => {
                            consecutive_errors = 0;
                            if !handle_packet(socket, protocol, packet, &mut imei, deps).await {
                                return imei;
                            }
                        }
                        Err(err) => {
                            consecutive_errors += 1;
                            warn!(target: log_target(&imei), "failed to decode frame: {:?}", err);
                            if consecutive_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                                warn!(target: log_target(&imei), "too many consecutive decode errors, closing connection");
                                return imei;
                            }
                        }
                    }
                }
                FrameOutcome::NeedMore => break,
                FrameOutcome::Invalid => {
                    warn!(target: log_target(&imei), "unrecoverable framing error, closing connection");
                    return imei;
                }
            }
        }
    }

    imei
}

fn log_target(imei: &Option<String>) -> &str {
    imei.as_deref().unwrap_or("unknown")
}

fn decode(frame: &[u8], protocol: Protocol, config: &Config) -> Result<DecodedPacket, CodecError> {
    match protocol {
        Protocol::Gt06 => gt06::decode_frame(frame, config.gt06_crc_fallback),
        Protocol::Teltonika => teltonika::decode_frame(frame, false),
    }
}

/// Handles one decoded packet: authorization gate, ACK, command drain, webhook forward.
/// Returns `false` if the connection must close.
async fn handle_packet(
    socket: &mut TcpStream,
    protocol: Protocol,
    packet: DecodedPacket,
    imei: &mut Option<String>,
    deps: &Arc<ConnectionDeps>,
) -> bool {
    if let Some(new_imei) = &packet.imei {
        match imei {
            Some(existing) if existing == new_imei => {}
            Some(existing) => {
                warn!(target: existing, "re-LOGIN with different IMEI [{}], closing connection", new_imei);
                return false;
            }
            None => *imei = Some(new_imei.clone()),
        }
    }

    let is_login = matches!(packet.payload, Payload::Teltonika(teltonika::TeltonikaPayload::Login { .. }))
        || (packet.packet_type == crate::protocol::PacketType::Login && protocol == Protocol::Gt06);

    if is_login {
        let authorized = match deps.presence.is_authorized(imei.as_deref().unwrap_or("")).await {
            Ok(authorized) => authorized,
            Err(err) => {
                warn!(target: log_target(imei), "authorization check failed: {:?}", err);
                false
            }
        };

        // Teltonika acks the handshake itself with a single accept/reject byte, ahead of
        // (and regardless of) the shared per-frame ack below.
        if matches!(packet.payload, Payload::Teltonika(teltonika::TeltonikaPayload::Login { .. })) {
            let ack = teltonika::encode_login_ack(authorized);
            if socket.write_all(&ack).await.is_err() {
                return false;
            }
        }

        if !authorized {
            warn!(target: log_target(imei), "rejected unauthorized device, closing connection");
            return false;
        }
        info!(target: log_target(imei), "device authenticated");
        // Falls through to the shared ack/forward/drain path (spec §4.3 step 3): LOGIN must
        // also upsert DeviceStatus{CONNECTED} and drain the IMEI's command queue before the
        // connection is considered settled.
    } else if imei.is_none() {
        // Non-LOGIN frame from a connection that never authenticated: drop it and close,
        // without ever ACKing (spec §4.3 point 4, OUT_OF_ORDER).
        warn!(target: log_target(imei), "out-of-order frame before login, closing connection");
        return false;
    }

    let ack = match protocol {
        Protocol::Gt06 => gt06::encode_ack(&packet),
        Protocol::Teltonika => teltonika::encode_ack(&packet),
    };
    if let Some(ack) = ack
        && socket.write_all(&ack).await.is_err()
    {
        return false;
    }

    let Some(current_imei) = imei.clone() else {
        return true;
    };

    forward_and_record(protocol, &packet, &current_imei, deps);
    drain_commands(socket, protocol, &current_imei, deps).await;

    true
}

fn forward_and_record(protocol: Protocol, packet: &DecodedPacket, imei: &str, deps: &Arc<ConnectionDeps>) {
    let records = match protocol {
        Protocol::Gt06 => gt06::to_device_record(packet, imei).into_iter().collect::<Vec<_>>(),
        Protocol::Teltonika => teltonika::to_device_records(packet, imei),
    };

    for record in records {
        let presence = deps.presence.clone();
        let webhook = deps.webhook.clone();
        tokio::spawn(async move {
            if let Err(err) = presence.upsert_status(&record).await {
                debug!(target: &record.imei, "failed to persist device status: {:?}", err);
            }
            webhook.forward(&record).await;
        });
    }
}

/// Drains at most one queued command per inbound packet, matching the teacher's
/// per-frame cadence rather than a separate polling task (spec §4.4).
async fn drain_commands(socket: &mut TcpStream, protocol: Protocol, imei: &str, deps: &Arc<ConnectionDeps>) {
    let queued = match deps.commands.pop(imei).await {
        Ok(Some(queued)) => queued,
        Ok(None) => return,
        Err(err) => {
            warn!(target: imei, "failed to pop queued command: {:?}", err);
            return;
        }
    };

    let frame = match protocol {
        Protocol::Gt06 => gt06::encode_command(&queued.command, rand::random()),
        Protocol::Teltonika => teltonika::encode_command(&queued.command),
    };

    match socket.write_all(&frame).await {
        Ok(()) => {
            if let Err(err) = deps.commands.ack(queued.id).await {
                warn!(target: imei, "failed to ack delivered command {}: {:?}", queued.id, err);
            }
        }
        Err(err) => {
            warn!(target: imei, "failed to write command {} to socket: {}", queued.id, err);
            if let Err(err) = deps.commands.requeue_head(imei, queued.id).await {
                warn!(target: imei, "failed to re-queue command {} after write failure: {:?}", queued.id, err);
            }
        }
    }
}
