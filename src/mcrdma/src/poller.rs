//! Completion queue polling.
use std::time::Duration;

use rdma::provider::{CmEvent, CompletionQueue, EventChannel};
use rdma::types::{CmEventType, WorkCompletion};

use crate::error::{Error, Result};

fn check_status(wc: &[WorkCompletion]) -> Result<()> {
    for (index, c) in wc.iter().enumerate() {
        if !c.status.is_success() {
            tracing::debug!(
                "work completion {} (wr_id {}) failed: {}, vendor_err: {}",
                index,
                c.wr_id,
                c.status,
                c.vendor_err
            );
            return Err(Error::CompletionFailed {
                status: c.status,
                index,
            });
        }
    }
    Ok(())
}

/// Busy polls `cq` until exactly `count` completions are stored in `wc`.
pub fn poll_cq<Q: CompletionQueue>(cq: &Q, wc: &mut [WorkCompletion], count: usize) -> Result<()> {
    assert!(count <= wc.len());
    let mut got = 0;
    while got < count {
        got += cq.poll(&mut wc[got..count]).map_err(Error::PollFailed)?;
    }
    check_status(&wc[..count])
}

/// Like [`poll_cq`], but every `interval` polls the connection's event channel is checked
/// without blocking. A disconnect aborts the wait with [`Error::PeerDisconnected`].
pub fn poll_cq_interleaved<Q, C>(
    cq: &Q,
    wc: &mut [WorkCompletion],
    count: usize,
    channel: &C,
    interval: usize,
) -> Result<()>
where
    Q: CompletionQueue,
    C: EventChannel,
    C::Event: CmEvent,
{
    assert!(count <= wc.len());
    let interval = interval.max(1);
    let mut got = 0;
    let mut iter = 0usize;
    while got < count {
        got += cq.poll(&mut wc[got..count]).map_err(Error::PollFailed)?;
        iter = iter.wrapping_add(1);
        if got < count && iter % interval == 0 {
            check_disconnect(channel)?;
        }
    }
    check_status(&wc[..count])
}

fn check_disconnect<C>(channel: &C) -> Result<()>
where
    C: EventChannel,
    C::Event: CmEvent,
{
    if !channel
        .poll(Some(Duration::ZERO))
        .map_err(Error::CmEvent)?
    {
        return Ok(());
    }
    let event = channel.get_cm_event().map_err(Error::CmEvent)?;
    match event.event() {
        CmEventType::Disconnected => {
            tracing::debug!("peer disconnected while polling");
            Err(Error::PeerDisconnected)
        }
        _ => {
            tracing::info!("ignoring cm event {} while polling", event);
            Ok(())
        }
    }
}
