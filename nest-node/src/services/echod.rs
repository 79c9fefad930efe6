//! A minimal TCP echo gateway.
//!
//! Listens on the address given at launch and echoes every byte back on
//! the connection it arrived on. Doubles as the smoke-test service for
//! the socket engine: accept, start, data, echo, close.

use std::sync::Arc;

use nest_runtime::message::{Message, Payload, PTYPE_SOCKET};
use nest_runtime::socket::{SOCKET_ACCEPT, SOCKET_CLOSE, SOCKET_CONNECT, SOCKET_DATA, SOCKET_ERR};
use nest_runtime::{ServiceContext, ServiceModule};

#[derive(Default)]
pub struct Echod {
    listen_id: u32,
}

impl Echod {
    pub fn new() -> Echod {
        Echod::default()
    }
}

impl ServiceModule for Echod {
    fn init(&mut self, ctx: &Arc<ServiceContext>, args: &str) -> Result<(), String> {
        let addr = if args.trim().is_empty() {
            "127.0.0.1:8888"
        } else {
            args.trim()
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("bad listen address {addr}"))?;
        let port: u16 = port.parse().map_err(|_| format!("bad port in {addr}"))?;
        let id = ctx
            .socket_listen(host, port, 128)
            .ok_or_else(|| format!("listen {addr} failed"))?;
        self.listen_id = id;
        ctx.socket_start(id);
        Ok(())
    }

    fn message(&mut self, ctx: &Arc<ServiceContext>, msg: Message) {
        if msg.ptype != PTYPE_SOCKET {
            return;
        }
        let Payload::Socket(ev) = msg.payload else {
            return;
        };
        match ev.kind {
            SOCKET_ACCEPT => {
                // ud carries the freshly accepted id; claim it.
                ctx.socket_start(ev.ud as u32);
            }
            SOCKET_CONNECT => {
                if ev.id == self.listen_id && ev.ud != 0 {
                    ctx.log_error(&format!("echod listening on port {}", ev.ud));
                }
            }
            SOCKET_DATA => {
                ctx.socket_send(ev.id, ev.buffer.into_vec());
            }
            SOCKET_ERR => {
                ctx.log_error(&format!(
                    "echod socket {} error: {}",
                    ev.id,
                    String::from_utf8_lossy(&ev.buffer)
                ));
            }
            SOCKET_CLOSE => {}
            _ => {}
        }
    }
}
