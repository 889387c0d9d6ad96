//! Lightweight bridge for reporting connection state and traffic to an
//! optional listener.
//!
//! A listener installed on the [`crate::ConnectionPool`] receives JSON
//! records whenever a tunnel connection changes state or a traffic snapshot
//! is published. With no listener installed nothing is serialized.

use crate::connection::ConnectionState;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Serialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
/// Packet counters of a pool at one point in time.
///
/// The text form carries the four packet counters only; the loop gauges are
/// part of the JSON record.
pub struct TunnelTraffic {
    pub sent_tunnel_packets: u64,
    pub recv_tunnel_packets: u64,
    pub sent_udp_packets: u64,
    pub recv_udp_packets: u64,
    pub active_senders: u64,
    pub active_receivers: u64,
}

impl fmt::Display for TunnelTraffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent_tunnel_packets: {}, recv_tunnel_packets: {}, sent_udp_packets: {}, recv_udp_packets: {}",
            self.sent_tunnel_packets,
            self.recv_tunnel_packets,
            self.sent_udp_packets,
            self.recv_udp_packets
        )
    }
}

#[derive(Serialize, Clone, Copy, Debug)]
/// A state transition of one tunnel connection.
pub(crate) struct TunnelState {
    pub connection_id: u64,
    pub state: ConnectionState,
}

#[derive(Serialize)]
/// Discriminator for the type of info carried in TunnelInfo.
pub(crate) enum TunnelInfoType {
    TunnelState,
    TunnelTraffic,
}

#[derive(Serialize)]
/// A serializable wrapper carrying a typed info payload for reporting.
pub(crate) struct TunnelInfo<T>
where
    T: ?Sized + Serialize,
{
    pub info_type: TunnelInfoType,
    pub data: Box<T>,
}

impl<T> TunnelInfo<T>
where
    T: ?Sized + Serialize,
{
    pub(crate) fn new(info_type: TunnelInfoType, data: Box<T>) -> Self {
        Self { info_type, data }
    }
}

type Listener = Arc<Mutex<dyn FnMut(&str) + 'static + Send + Sync>>;

#[derive(Clone, Default)]
/// Posts serialized tunnel info to a user-provided listener, if installed.
pub(crate) struct TunnelInfoBridge {
    listener: Option<Listener>,
}

impl TunnelInfoBridge {
    pub(crate) fn new() -> Self {
        TunnelInfoBridge { listener: None }
    }

    /// Install a listener that will receive JSON-serialized TunnelInfo payloads.
    pub(crate) fn set_listener(&mut self, listener: impl FnMut(&str) + 'static + Send + Sync) {
        self.listener = Some(Arc::new(Mutex::new(listener)));
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    pub(crate) fn post_state(&self, connection_id: u64, state: ConnectionState) {
        if self.has_listener() {
            self.post_tunnel_info(TunnelInfo::new(
                TunnelInfoType::TunnelState,
                Box::new(TunnelState {
                    connection_id,
                    state,
                }),
            ));
        }
    }

    pub(crate) fn post_traffic(&self, traffic: TunnelTraffic) {
        if self.has_listener() {
            self.post_tunnel_info(TunnelInfo::new(
                TunnelInfoType::TunnelTraffic,
                Box::new(traffic),
            ));
        }
    }

    /// Serialize and post a TunnelInfo to the installed listener (if any).
    pub(crate) fn post_tunnel_info<T>(&self, data: TunnelInfo<T>)
    where
        T: ?Sized + Serialize,
    {
        if let Some(ref listener) = self.listener {
            if let Ok(json) = serde_json::to_string(&data) {
                if let Ok(mut listener) = listener.lock() {
                    listener(json.as_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_bridge() -> (TunnelInfoBridge, Arc<Mutex<Vec<String>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = records.clone();
        let mut bridge = TunnelInfoBridge::new();
        bridge.set_listener(move |json| sink.lock().unwrap().push(json.to_string()));
        (bridge, records)
    }

    #[test]
    fn no_listener_posts_nothing() {
        let bridge = TunnelInfoBridge::new();
        assert!(!bridge.has_listener());
        bridge.post_traffic(TunnelTraffic::default());
    }

    #[test]
    fn posts_state_as_json() {
        let (bridge, records) = recording_bridge();
        bridge.post_state(7, ConnectionState::Reconnecting);

        let records = records.lock().unwrap();
        let value: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(value["info_type"], "TunnelState");
        assert_eq!(value["data"]["connection_id"], 7);
        assert_eq!(value["data"]["state"], "Reconnecting");
    }

    #[test]
    fn posts_traffic_as_json() {
        let (bridge, records) = recording_bridge();
        bridge.post_traffic(TunnelTraffic {
            sent_tunnel_packets: 1,
            recv_tunnel_packets: 2,
            sent_udp_packets: 3,
            recv_udp_packets: 4,
            active_senders: 2,
            active_receivers: 3,
        });

        let records = records.lock().unwrap();
        let value: serde_json::Value = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(value["info_type"], "TunnelTraffic");
        assert_eq!(value["data"]["recv_udp_packets"], 4);
        assert_eq!(value["data"]["active_receivers"], 3);
    }

    #[test]
    fn traffic_renders_as_text() {
        let traffic = TunnelTraffic {
            sent_tunnel_packets: 10,
            recv_tunnel_packets: 20,
            sent_udp_packets: 30,
            recv_udp_packets: 40,
            ..Default::default()
        };
        assert_eq!(
            traffic.to_string(),
            "sent_tunnel_packets: 10, recv_tunnel_packets: 20, sent_udp_packets: 30, recv_udp_packets: 40"
        );
    }
}
