//! CLI transports and command decoding.
//!
//! Each transport accepts one newline-terminated line at a time and
//! decides command versus G-code. Realtime commands (`!`, `~`, `?`,
//! `X`) act on the shared state directly; `$` commands and G-code lines
//! queue to the parser worker and block for its reply. Two transports
//! feed the same queue: stdin and a TCP listener.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use crossbeam_channel::{Sender, bounded};
use tracing::{error, info, warn};

use photon_common::settings::Settings;
use photon_common::state::{StatePort, SysState};
use photon_common::status::Status;

use crate::report::{self, Reply};
use crate::worker::Request;

/// Shared context for every transport.
#[derive(Clone)]
pub struct CliContext {
    pub tx: Sender<Request>,
    pub port: StatePort,
    pub settings: Arc<Settings>,
}

impl CliContext {
    /// Send a request to the parser worker and wait for its reply.
    fn roundtrip(&self, build: impl FnOnce(Sender<Reply>) -> Request) -> Reply {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(build(reply_tx)).is_err() {
            return Reply::Error(Status::IdleError);
        }
        reply_rx.recv().unwrap_or(Reply::Error(Status::IdleError))
    }
}

/// Decode and execute one input line, returning the rendered reply.
pub fn handle_line(raw: &str, ctx: &CliContext) -> String {
    let line = raw.trim_end_matches(['\r', '\n']);
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Reply::Ok.render();
    }

    let state = ctx.port.signals().state();
    match trimmed {
        "!" => {
            // Feed hold: meaningful only while executing queued motion.
            if state == SysState::Run {
                ctx.port.request(SysState::Hold);
                Reply::Ok.render()
            } else {
                Reply::Error(Status::UnsupportedCommand).render()
            }
        }
        "~" => match state {
            SysState::Hold => {
                ctx.port.request(SysState::Run);
                Reply::Ok.render()
            }
            SysState::Idle => ctx.roundtrip(|reply| Request::CycleStart { reply }).render(),
            _ => Reply::Error(Status::UnsupportedCommand).render(),
        },
        "?" => report::status_report(ctx.port.signals(), &ctx.settings),
        "X" | "x" => {
            ctx.port.signals().set_abort(true);
            ctx.roundtrip(|reply| Request::Reset { reply }).render()
        }
        "$" => report::help().to_string(),
        "$H" | "$h" => ctx.roundtrip(|reply| Request::Home { reply }).render(),
        "$T" | "$t" => ctx.roundtrip(|reply| Request::Test { reply }).render(),
        "$SLP" | "$slp" => ctx.roundtrip(|reply| Request::Sleep { reply }).render(),
        "$C" | "$c" => ctx
            .roundtrip(|reply| Request::CheckToggle { reply })
            .render(),
        _ if trimmed.starts_with('$') => Reply::Error(Status::UnsupportedCommand).render(),
        _ => ctx
            .roundtrip(|reply| Request::Gcode {
                line: line.to_string(),
                reply,
            })
            .render(),
    }
}

/// Read lines from stdin until EOF. Runs on the caller's thread.
pub fn stdin_loop(ctx: CliContext) {
    println!("{}", report::banner());
    let stdin = std::io::stdin();
    let mut buffer = String::new();
    loop {
        buffer.clear();
        match stdin.read_line(&mut buffer) {
            Ok(0) => return,
            Ok(_) => println!("{}", handle_line(&buffer, &ctx)),
            Err(e) => {
                error!("stdin: {e}");
                return;
            }
        }
    }
}

/// Accept TCP connections, one reader thread per client.
pub fn spawn_tcp_listener(ctx: CliContext) -> std::io::Result<std::thread::JoinHandle<()>> {
    let addr = format!("{}:{}", ctx.settings.listen_addr, ctx.settings.listen_port);
    let listener = TcpListener::bind(&addr)?;
    info!("listening on {addr}");
    let handle = std::thread::Builder::new()
        .name("tcp-listener".into())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let conn_ctx = ctx.clone();
                        let _ = std::thread::Builder::new()
                            .name("tcp-client".into())
                            .spawn(move || client_loop(stream, conn_ctx));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        })?;
    Ok(handle)
}

fn client_loop(stream: TcpStream, ctx: CliContext) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    info!("client connected: {peer}");
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!("client {peer}: {e}");
            return;
        }
    };
    if writeln!(writer, "\r\n{}", report::banner()).is_err() {
        return;
    }
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let reply = handle_line(&line, &ctx);
        if writeln!(writer, "{reply}\r").is_err() {
            break;
        }
    }
    info!("client disconnected: {peer}");
}
