//! Bus abstraction and the MQTT adapter.
//!
//! The rule engine only ever *publishes*; incoming traffic is handled by the
//! driver, which feeds the cell model. Both sides follow the
//! `/devices/<device>/controls/<control>` topic convention.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::cell::CellSpec;
use crate::model::CellModel;

/// MQTT QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl Default for Qos {
    fn default() -> Self {
        Self::AtLeastOnce
    }
}

impl Qos {
    /// Convert a script-supplied QoS number; values above 2 are invalid.
    pub fn from_u8(qos: u8) -> Option<Self> {
        match qos {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Outbound side of the bus as the engine sees it.
///
/// Publishing is fire-and-forget; failures are logged, never surfaced to
/// rule scripts.
pub trait BusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retained: bool);
}

/// MQTT connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address.
    pub broker: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// Clean session flag.
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    /// Reconnect back-off in milliseconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    5000
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            clean_session: default_clean_session(),
            reconnect_interval_ms: default_reconnect_interval(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Publisher backed by a rumqttc client.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl BusPublisher for MqttBus {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retained: bool) {
        let qos = Qos::from_u8(qos).unwrap_or_default();
        if let Err(err) = self
            .client
            .try_publish(topic, qos.into(), retained, payload)
        {
            warn!(topic, %err, "dropping bus publish");
        }
    }
}

/// Bus→model driver: subscribes to cell topics, feeds the model and signals
/// readiness once the initial subscription is acknowledged.
pub struct MqttDriver;

impl MqttDriver {
    /// Connect and start the driver task. Returns the publisher, which is
    /// also attached to the model for engine-initiated writes.
    pub fn start(config: MqttConfig, model: CellModel) -> MqttBus {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| "hearth-rules".to_string());
        let mut opts = MqttOptions::new(client_id, config.broker.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let bus = MqttBus {
            client: client.clone(),
        };
        model.set_bus(Arc::new(bus.clone()));

        let reconnect = Duration::from_millis(config.reconnect_interval_ms);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("connected to broker, subscribing to cell topics");
                        let client = client.clone();
                        tokio::spawn(async move {
                            for topic in [
                                "/devices/+/controls/+",
                                "/devices/+/controls/+/meta/type",
                            ] {
                                if let Err(err) =
                                    client.subscribe(topic, QoS::AtLeastOnce).await
                                {
                                    error!(topic, %err, "subscribe failed");
                                }
                            }
                        });
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        model.mark_ready();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload);
                        route(&model, &publish.topic, &payload);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(%err, "mqtt connection error, reconnecting");
                        tokio::time::sleep(reconnect).await;
                    }
                }
            }
        });

        bus
    }
}

fn route(model: &CellModel, topic: &str, payload: &str) {
    let Some(rest) = topic.strip_prefix("/devices/") else {
        return;
    };
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [device, "controls", control] => {
            let spec = CellSpec::new(*device, *control);
            debug!(cell = %spec, payload, "cell value from bus");
            model.apply_bus_value(&spec, payload);
        }
        [device, "controls", control, "meta", "type"] => {
            let spec = CellSpec::new(*device, *control);
            model.apply_bus_meta_type(&spec, payload);
        }
        // Command echoes and other metadata are not ours to track.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::CellValue;

    #[test]
    fn config_defaults() {
        let config: MqttConfig = serde_json::from_str(r#"{"broker": "localhost"}"#).unwrap();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, 60);
        assert!(config.clean_session);
    }

    #[test]
    fn routing_feeds_the_model() {
        let model = CellModel::new();
        route(&model, "/devices/Weather/controls/Temp1", "18");
        let spec = CellSpec::new("Weather", "Temp1");
        assert_eq!(model.value(&spec), Some(CellValue::Number(18.0)));

        route(&model, "/devices/Weather/controls/Temp1/meta/type", "text");
        assert_eq!(model.value(&spec), Some(CellValue::Text("18".into())));

        // Not cell traffic; must be ignored.
        route(&model, "/devices/Weather/meta/name", "Weather station");
        route(&model, "/devices/Relays/controls/Relay1/on", "1");
        assert!(!model.is_complete(&CellSpec::new("Relays", "Relay1")));
    }
}
