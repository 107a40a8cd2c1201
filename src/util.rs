use std::{future::Future, io, pin::Pin, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::{future::FutureExt, io::InspectReader};
use tracing::{debug, trace};

pub use self::prebuffered::Prebuffered;

mod prebuffered;

/// Bidirectionally forwards bytes between a client reader/writer pair and a
/// target reader/writer pair.
///
/// EOF in one direction is propagated as a write shutdown to the other side.
/// The other direction then gets at most `drain` to finish before both sides
/// are dropped, so a peer that never closes cannot keep the relay alive.
/// An error in either direction ends the relay immediately.
///
/// Returns `(client_to_target, target_to_client)` byte counts.
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Unpin),
    client_send: &mut (impl AsyncWrite + Unpin),
    target_recv: &mut (impl AsyncRead + Unpin),
    target_send: &mut (impl AsyncWrite + Unpin),
    drain: Duration,
) -> io::Result<(u64, u64)> {
    let start = n0_future::time::Instant::now();
    let mut to_target = 0u64;
    let mut to_client = 0u64;
    {
        let mut client_recv =
            InspectReader::new(client_recv, |bytes: &[u8]| to_target += bytes.len() as u64);
        let mut target_recv =
            InspectReader::new(target_recv, |bytes: &[u8]| to_client += bytes.len() as u64);
        let up = async {
            let res = tokio::io::copy(&mut client_recv, target_send).await;
            target_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward client-to-target finished");
            res
        };
        let down = async {
            let res = tokio::io::copy(&mut target_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "forward target-to-client finished");
            res
        };
        tokio::pin!(up, down);
        tokio::select! {
            res = &mut up => {
                res?;
                drain_rest(down, drain, "target-to-client").await?;
            }
            res = &mut down => {
                res?;
                drain_rest(up, drain, "client-to-target").await?;
            }
        }
    }
    Ok((to_target, to_client))
}

/// Lets the remaining direction of a half-closed relay finish within `drain`.
async fn drain_rest(
    rest: Pin<&mut impl Future<Output = io::Result<u64>>>,
    drain: Duration,
    direction: &str,
) -> io::Result<()> {
    match rest.timeout(drain).await {
        Ok(res) => res.map(drop),
        Err(_) => {
            debug!(?drain, direction, "peer kept its side open after close, dropping both sides");
            Ok(())
        }
    }
}
