//! Per-connection sessions on the query socket.
//!
//! A session thread only frames bytes: it decodes a request, posts it to the
//! main loop with a reply channel, and writes the response back. Every lookup
//! and mutation happens on the main thread.

use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::protocol::{self, MessageId, Request, Response};

use super::MainTask;

/// Accepts connections forever, one session thread per client.
pub fn spawn_acceptor(
    listener: UnixListener,
    main_tx: Sender<MainTask>,
) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("symdb-acceptor".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = main_tx.clone();
                        let spawned = thread::Builder::new()
                            .name("symdb-session".to_string())
                            .spawn(move || {
                                if let Err(e) = run_session(stream, tx) {
                                    debug!(error = %e, "session ended");
                                }
                            });
                        if let Err(e) = spawned {
                            error!(error = %e, "cannot spawn session thread");
                        }
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
        })?;
    Ok(handle)
}

fn run_session(mut stream: UnixStream, main_tx: Sender<MainTask>) -> Result<()> {
    loop {
        let Some((head, body)) = protocol::read_frame(&mut stream)? else {
            return Ok(());
        };

        let request = match Request::decode(head.msg_id, &body) {
            Ok(request) => request,
            Err(e) => {
                warn!(msg_id = head.msg_id, error = %e, "undecodable request");
                // Reply with the paired error response when the id is known;
                // an unknown id gets nothing but the log line.
                let error_rsp = MessageId::from_i32(head.msg_id)
                    .and_then(|id| Response::error_for(id, format!("bad request: {e}")));
                if let Some(rsp) = error_rsp {
                    protocol::write_response(&mut stream, &rsp)?;
                }
                continue;
            }
        };

        let (reply_tx, reply_rx) = bounded(1);
        if main_tx
            .send(MainTask::Request {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            return Ok(());
        }
        let Ok(response) = reply_rx.recv() else {
            return Ok(());
        };
        protocol::write_response(&mut stream, &response)?;
    }
}
