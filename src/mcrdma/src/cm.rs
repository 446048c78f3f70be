//! Connection-manager event helper.
use std::time::Duration;

use rdma::provider::{CmEvent, EventChannel};
use rdma::types::CmEventType;

use crate::error::{Error, Result};

/// Waits for the next event on `channel` and checks that it is `expected` and succeeded.
///
/// Blocks indefinitely when `timeout` is `None`. A rejected event is acknowledged before the
/// error is returned; an accepted one is acknowledged when the caller drops it.
pub fn process_event<C>(
    channel: &C,
    expected: CmEventType,
    timeout: Option<Duration>,
) -> Result<C::Event>
where
    C: EventChannel,
    C::Event: CmEvent,
{
    while !channel.poll(timeout).map_err(Error::CmEvent)? {
        if timeout.is_some() {
            return Err(Error::CmEventTimeout);
        }
    }

    let event = channel.get_cm_event().map_err(Error::CmEvent)?;
    if event.status() != 0 {
        let status = event.status();
        tracing::warn!("cm event {} has non-zero status {}", event, status);
        return Err(Error::RemoteRejected { status });
    }
    if event.event() != expected {
        tracing::warn!("unexpected cm event {}, expecting {}", event, expected);
        return Err(Error::UnexpectedEvent {
            received: event.event(),
            expected,
        });
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma::provider::{CmId, Provider};
    use rdma::sim::SimFabric;
    use rdma::types::{ConnParam, PortSpace};

    #[test]
    fn expected_event_is_returned() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel, PortSpace::TCP).unwrap();
        id.resolve_addr(&"127.0.0.1:7".parse().unwrap(), 2000).unwrap();
        let ev = process_event(&channel, CmEventType::AddrResolved, None).unwrap();
        assert_eq!(ev.event(), CmEventType::AddrResolved);
    }

    #[test]
    fn mismatched_event_is_rejected() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel, PortSpace::TCP).unwrap();
        id.resolve_addr(&"127.0.0.1:7".parse().unwrap(), 2000).unwrap();
        match process_event(&channel, CmEventType::RouteResolved, None) {
            Err(Error::UnexpectedEvent { received, expected }) => {
                assert_eq!(received, CmEventType::AddrResolved);
                assert_eq!(expected, CmEventType::RouteResolved);
            }
            other => panic!("unexpected result: {:?}", other.map(|e| e.to_string())),
        }
    }

    #[test]
    fn non_zero_status_is_rejected() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        let id = fabric.create_id(&channel, PortSpace::TCP).unwrap();
        id.resolve_addr(&"127.0.0.1:7".parse().unwrap(), 2000).unwrap();
        drop(process_event(&channel, CmEventType::AddrResolved, None).unwrap());
        id.resolve_route(2000).unwrap();
        drop(process_event(&channel, CmEventType::RouteResolved, None).unwrap());
        // nobody listens on port 7
        id.connect(&ConnParam::default()).unwrap();
        assert!(matches!(
            process_event(&channel, CmEventType::Established, None),
            Err(Error::RemoteRejected { .. })
        ));
    }

    #[test]
    fn times_out_when_idle() {
        let fabric = SimFabric::new();
        let channel = fabric.create_event_channel().unwrap();
        assert!(matches!(
            process_event(
                &channel,
                CmEventType::ConnectRequest,
                Some(Duration::from_millis(5))
            ),
            Err(Error::CmEventTimeout)
        ));
    }
}
