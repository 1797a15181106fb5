//! Socket <-> SSH channel bridge shared by both forward directions
//!
//! One loop owns both the socket and the channel, so no lock is needed around
//! the channel and either side closing ends the bridge.

use std::sync::atomic::Ordering;
use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::ForwardCounters;

/// Idle timeout for forwarded connections (5 minutes)
pub const FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const BRIDGE_BUFFER_SIZE: usize = 32 * 1024;

/// Shovel bytes until either side closes or the pair idles out
pub async fn bridge_channel(
    mut local: TcpStream,
    mut channel: Channel<Msg>,
    counters: &ForwardCounters,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => {
                debug!("Forward idle timeout ({}s), closing", idle_timeout.as_secs());
                break;
            }

            read = local.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Forward local side EOF");
                    let _ = channel.eof().await;
                    break;
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buf[..n]).await {
                        debug!("Channel write error: {}", e);
                        break;
                    }
                    counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                Err(e) => {
                    debug!("Local read error: {}", e);
                    break;
                }
            },

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Err(e) = local.write_all(&data).await {
                        debug!("Local write error: {}", e);
                        break;
                    }
                    counters.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("Channel closed by remote");
                    break;
                }
                Some(_) => {}
            },
        }
    }

    let _ = channel.close().await;
    let _ = local.shutdown().await;
}
