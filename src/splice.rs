//! The bidirectional byte pump.
//!
//! Two directional copy loops driven from one task: each direction is a
//! linear read-then-write sequence, EOF on one side half-closes the peer,
//! and a single idle deadline covers both directions. Every exit path
//! leaves both streams shut down exactly once.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::classify::{classify, ErrorClass};

const COPY_BUF: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
    /// Both directions reached EOF.
    BothClosed,
    /// Nothing moved in either direction for the idle window.
    Idle,
    /// One side errored; the error was classified and logged if warranted.
    Error,
}

#[derive(Debug)]
pub struct SpliceOutcome {
    pub end: SpliceEnd,
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Pump bytes between `a` and `b` until both directions hit EOF, either
/// side errors, or no bytes flow for `idle`.
pub async fn splice<A, B>(a: A, b: B, idle: Duration, tag: &str) -> SpliceOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);
    let mut a_buf = vec![0u8; COPY_BUF];
    let mut b_buf = vec![0u8; COPY_BUF];
    let mut a_open = true;
    let mut b_open = true;
    let mut a_to_b: u64 = 0;
    let mut b_to_a: u64 = 0;
    let mut deadline = Instant::now() + idle;
    let mut end = SpliceEnd::BothClosed;

    while a_open || b_open {
        tokio::select! {
            res = a_rd.read(&mut a_buf), if a_open => match res {
                Ok(0) => {
                    a_open = false;
                    let _ = b_wr.shutdown().await;
                }
                Ok(n) => {
                    if let Err(e) = b_wr.write_all(&a_buf[..n]).await {
                        log_pump_error(tag, "a->b write", &e);
                        end = SpliceEnd::Error;
                        break;
                    }
                    a_to_b += n as u64;
                    deadline = Instant::now() + idle;
                }
                Err(e) => {
                    log_pump_error(tag, "a read", &e);
                    end = SpliceEnd::Error;
                    break;
                }
            },
            res = b_rd.read(&mut b_buf), if b_open => match res {
                Ok(0) => {
                    b_open = false;
                    let _ = a_wr.shutdown().await;
                }
                Ok(n) => {
                    if let Err(e) = a_wr.write_all(&b_buf[..n]).await {
                        log_pump_error(tag, "b->a write", &e);
                        end = SpliceEnd::Error;
                        break;
                    }
                    b_to_a += n as u64;
                    deadline = Instant::now() + idle;
                }
                Err(e) => {
                    log_pump_error(tag, "b read", &e);
                    end = SpliceEnd::Error;
                    break;
                }
            },
            _ = sleep_until(deadline) => {
                debug!("splice {tag}: idle for {idle:?}, tearing down");
                end = SpliceEnd::Idle;
                break;
            }
        }
    }

    // Shutting down an already-closed half is a no-op we ignore.
    let _ = a_wr.shutdown().await;
    let _ = b_wr.shutdown().await;

    SpliceOutcome { end, a_to_b, b_to_a }
}

fn log_pump_error(tag: &str, side: &str, err: &io::Error) {
    match classify(err) {
        ErrorClass::BenignDrop => debug!("splice {tag}: {side} dropped: {err}"),
        _ => warn!("splice {tag}: {side} failed: {err}"),
    }
}
