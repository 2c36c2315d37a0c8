//! C5 — Event Bus Listener.
//!
//! Turns host-daemon SA lifecycle callbacks into the JSON event payloads
//! published over the control channel (spec §4.5), and is the trigger
//! point for the failover controller (C6) on connection failure.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::failover::FailoverController;
use crate::host::{ChildSaHandle, HostAdapter, IkeSaHandle, SaMode, SaProtocol};

/// Sink the event listener publishes JSON event payloads through. C7
/// implements this over the control channel's single client connection.
pub trait EventSink: Send + Sync {
    fn publish(&self, payload: Value);
}

fn protocol_str(protocol: SaProtocol) -> &'static str {
    match protocol {
        SaProtocol::Esp => "esp",
        SaProtocol::Ah => "ah",
        SaProtocol::Unknown => "unknown",
    }
}

fn mode_str(mode: SaMode) -> &'static str {
    match mode {
        SaMode::Tunnel => "tunnel",
        SaMode::Transport => "transport",
        SaMode::Unknown => "unknown",
    }
}

/// Subscribes to the host daemon's event bus and republishes each
/// notification as a JSON document on the control channel.
pub struct EventListener {
    host: Arc<HostAdapter>,
    failover: Arc<FailoverController>,
    sink: Arc<dyn EventSink>,
}

impl EventListener {
    pub fn new(host: Arc<HostAdapter>, failover: Arc<FailoverController>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self { host, failover, sink })
    }

    /// IKE_SA transitioned up or down. A down transition that never saw
    /// ESTABLISHED is treated as a connection failure and handed to the
    /// failover controller (spec §4.5, §4.6).
    pub fn on_ike_updown(&self, ike: &dyn IkeSaHandle, up: bool) {
        let event = if up { "ike_sa_up" } else { "ike_sa_down" };
        self.sink.publish(json!({
            "event": event,
            "ike_sa_name": ike.name(),
            "state": ike.state(),
            "local_host": ike.local_host(),
            "remote_host": ike.remote_host(),
        }));

        if up {
            if let Some(name) = ike.peer_config_name() {
                self.failover.reset_retry_count(&name);
            }
            return;
        }

        if ike.reached_established() {
            return;
        }

        let Some(peer_name) = ike.peer_config_name() else {
            return;
        };
        let Some(peer) = self.host.registry().find_by_name(&peer_name) else {
            return;
        };
        if let Err(error) = self.failover.handle_connection_failure(&peer, ike) {
            tracing::warn!(%error, name = %peer_name, "failover attempt failed");
        }
    }

    /// CHILD_SA transitioned up or down, republished as the unified
    /// `tunnel_up`/`tunnel_down` event (spec §4.5: "child SA lifecycle is
    /// reported to callers as tunnel up/down, not as a raw child-SA
    /// state change").
    pub fn on_child_updown(&self, ike: &dyn IkeSaHandle, child: &dyn ChildSaHandle, up: bool) {
        let event = if up { "tunnel_up" } else { "tunnel_down" };
        self.sink.publish(tunnel_payload(event, ike, child));
    }

    /// IKE_SA rekeyed: the old SA is replaced in place by `new_sa`.
    pub fn on_ike_rekey(&self, old: &dyn IkeSaHandle, new: &dyn IkeSaHandle) {
        self.sink.publish(json!({
            "event": "ike_rekey",
            "old_ike_sa_name": old.name(),
            "new_ike_sa_name": new.name(),
            "remote_host": new.remote_host(),
        }));
    }

    /// CHILD_SA rekeyed. The original usecase also synthesizes a
    /// `tunnel_up` for the replacement child, since callers otherwise
    /// never see the new child come up on its own (spec §4.5).
    pub fn on_child_rekey(&self, ike: &dyn IkeSaHandle, old: &dyn ChildSaHandle, new: &dyn ChildSaHandle) {
        self.sink.publish(json!({
            "event": "child_rekey",
            "ike_sa_name": ike.name(),
            "old_child_name": old.name(),
            "new_child_name": new.name(),
        }));
        self.sink.publish(tunnel_payload("tunnel_up", ike, new));
    }
}

/// Builds the unified `tunnel_up`/`tunnel_down` payload (spec §4.5, literal
/// shape worked through in §8 scenario S4).
fn tunnel_payload(event: &str, ike: &dyn IkeSaHandle, child: &dyn ChildSaHandle) -> Value {
    json!({
        "event": event,
        "ike_sa_name": ike.name(),
        "child_sa_name": child.name(),
        "ike_sa_state": ike.state(),
        "child_sa_state": child.state(),
        "spi": child.inbound_spi(),
        "proto": protocol_str(child.protocol()),
        "mode": mode_str(child.mode()),
        "enc_alg": child.enc_alg(),
        "integ_alg": child.integ_alg(),
        "src": ike.local_host(),
        "dst": ike.remote_host(),
        "local_ts": child.local_ts(),
        "remote_ts": child.remote_ts(),
        "direction": "out",
        "policy_action": "protect",
    })
}
