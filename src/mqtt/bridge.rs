//! MQTT connection lifecycle. The client library owns reconnection and
//! keep-alive; this runtime announces entities on every ConnAck (which also
//! re-establishes subscriptions after a reconnect) and dispatches inbound
//! publishes to the owning entity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, LastWill, MqttOptions, Packet, Publish,
    QoS,
};
use tokio::sync::Notify;

use crate::config::MqttConfig;
use crate::error::BridgeError;
use crate::mqtt::entity::BridgeEntity;

/// Bound of the client's request queue; publishes beyond this fail fast in
/// `try_publish` instead of blocking an observer callback.
const REQUEST_CHANNEL_CAPACITY: usize = 64;

pub struct MqttBridge {
    client: AsyncClient,
    eventloop: rumqttc::EventLoop,
    entities: Vec<BridgeEntity>,
    /// Command topic -> entity index, for O(1) inbound dispatch.
    routes: HashMap<String, usize>,
    availability_topic: String,
}

impl MqttBridge {
    /// Create the client and wire every entity's state publisher. Nothing
    /// touches the network until [`MqttBridge::run`] polls the event loop.
    pub fn new(cfg: &MqttConfig, entities: Vec<BridgeEntity>) -> MqttBridge {
        let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let Some(username) = &cfg.username {
            options.set_credentials(username, cfg.password.as_deref().unwrap_or(""));
        }
        let availability_topic = format!("{}/scheiber/bridge/availability", cfg.discovery_prefix);
        options.set_last_will(LastWill::new(
            &availability_topic,
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        for entity in &entities {
            entity.attach_publisher(&client);
        }
        let routes = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.topics().command.clone(), i))
            .collect();

        MqttBridge {
            client,
            eventloop,
            entities,
            routes,
            availability_topic,
        }
    }

    /// Drive the connection until `shutdown` fires. Returns an error only
    /// for an authentication refusal before the first successful connect;
    /// everything after that is the client library's reconnect problem.
    pub async fn run(self, shutdown: Arc<Notify>) -> Result<(), BridgeError> {
        let MqttBridge {
            client,
            mut eventloop,
            entities,
            routes,
            availability_topic,
        } = self;
        let mut connected_once = false;
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    // A clean shutdown leaves the retained "online" in
                    // place; only the last will flips it to "offline" when
                    // the connection dies ungracefully.
                    info!("MQTT bridge stopped");
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            if !connected_once && is_auth_refusal(ack.code) {
                                return Err(BridgeError::MqttAuthFailed(format!("{:?}", ack.code)));
                            }
                            warn!("broker refused connection: {:?}", ack.code);
                            continue;
                        }
                        connected_once = true;
                        info!("connected to MQTT broker");
                        announce(&client, &entities, &availability_topic).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(&client, &entities, &routes, publish).await;
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        if !connected_once && is_auth_refusal(code) {
                            return Err(BridgeError::MqttAuthFailed(format!("{code:?}")));
                        }
                        warn!("MQTT connection refused: {code:?}; retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Err(e) => {
                        warn!("MQTT connection error: {e}; retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
            }
        }
    }
}

/// Publish discovery + availability + current state and subscribe the
/// command topics. Runs on every ConnAck so a reconnect restores the full
/// session.
async fn announce(client: &AsyncClient, entities: &[BridgeEntity], availability_topic: &str) {
    let _ = client
        .publish(availability_topic, QoS::AtLeastOnce, true, "online")
        .await;

    for entity in entities {
        let topics = entity.topics();
        if let Err(e) = client
            .publish(&topics.config, QoS::AtLeastOnce, true, entity.discovery_json())
            .await
        {
            warn!("{}: discovery publish failed: {e}", entity.entity_id());
        }
        if let Err(e) = client.subscribe(&topics.command, QoS::AtLeastOnce).await {
            warn!("{}: command subscribe failed: {e}", entity.entity_id());
        }
        let _ = client
            .publish(&topics.availability, QoS::AtLeastOnce, true, "online")
            .await;
        let _ = client
            .publish(
                &topics.state,
                QoS::AtLeastOnce,
                true,
                entity.current_state_payload(),
            )
            .await;
    }
    info!("announced {} entities", entities.len());
}

async fn handle_publish(
    client: &AsyncClient,
    entities: &[BridgeEntity],
    routes: &HashMap<String, usize>,
    publish: Publish,
) {
    let Some(&idx) = routes.get(publish.topic.as_str()) else {
        debug!("message on unrouted topic {}", publish.topic);
        return;
    };
    let entity = &entities[idx];
    match entity.handle_command(&publish.payload, publish.retain).await {
        Ok(()) => {}
        Err(e @ BridgeError::StaleRetainedCommand { .. }) => {
            debug!("{}: {e}; clearing retained command", entity.entity_id());
            let _ = client
                .publish(&publish.topic, QoS::AtLeastOnce, true, Vec::<u8>::new())
                .await;
        }
        Err(e) => warn!("{}: {e}", entity.entity_id()),
    }
}

fn is_auth_refusal(code: ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}
