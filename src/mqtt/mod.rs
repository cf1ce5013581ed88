pub mod ha_interface;

use crate::config::{ConfigBases, MarstekConfig};
use crate::metering_marstek::state::{Availability, PowerReading};
use crate::mqtt::ha_interface::HaSensor;
use crate::{get_config_or_panic, CONFIG};
use lazy_static::lazy_static;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::io::Error;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub enum Transmission {
    Reading(PowerReading),
    Availability(Availability),
    AutoDiscovery(HaSensor),
    Publish(PublishData),
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
    meter_config: MarstekConfig,
}

lazy_static! {
    static ref APP_START: Instant = Instant::now();
}

pub fn uptime_seconds() -> u64 {
    return APP_START.elapsed().as_secs();
}

impl MqttManager {
    pub fn new() -> Result<(Self, Sender<Transmission>), Error> {
        let (mtx, mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection starting up");
        let config = get_config_or_panic!("mqtt", ConfigBases::Mqtt);
        let meter_config = get_config_or_panic!("marstek", ConfigBases::Marstek);

        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(config.user.clone(), config.pass.clone());

        /* The broker flags us offline if the process dies without saying goodbye */
        mqttoptions.set_last_will(LastWill::new(
            meter_config.availability_topic(),
            Availability::Offline.payload(),
            QoS::ExactlyOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        tokio::spawn(async move {
            info!("MQTT Eventloop started");

            let mut last_error = String::new();
            let mut counter = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to the MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if e.to_string() == last_error {
                            /* Rate limting */
                            counter += 1;
                            if counter < 100_000 {
                                continue;
                            }
                        }

                        counter = 0;
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        last_error = e.to_string();
                    }
                }
            }
        });

        return Ok((MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
            meter_config: meter_config,
        }, mtx));
    }

    pub async fn start_thread(&mut self) {

        // Handle all the incomming metering stuff
        while !self.exit_thread {
            let option = self.rx.recv().await;

            if option.is_none() {
                debug!("Reading returned none, we exit now");
                self.exit_thread = true;
                continue;
            }

            match option.unwrap() {
                Transmission::Reading(reading) => {
                    debug!("Publishing reading {:?}", reading);
                    for (phase, value) in reading.phases() {
                        let topic = self.meter_config.phase_topic(phase);
                        if let Err(e) = self.client.publish(topic, QoS::ExactlyOnce, false, value.to_string()).await {
                            error!("Error publishing phase {}: {}", phase, e);
                        }
                    }
                },
                Transmission::Availability(availability) => {
                    info!("Publishing meter availability: {}", availability.payload());
                    let topic = self.meter_config.availability_topic();
                    if let Err(e) = self.client.publish(topic, QoS::ExactlyOnce, true, availability.payload()).await {
                        error!("Error publishing availability: {}", e);
                    }
                },
                Transmission::AutoDiscovery(sensor) => {
                    let _ = self.client.publish(
                        sensor.discover_topic.clone(),
                        QoS::AtLeastOnce,
                        true,
                        serde_json::to_string(&sensor).unwrap()).await;
                },
                Transmission::Publish(publish_data) => {
                    match self.client.publish(
                        publish_data.topic,
                        match publish_data.qos {
                            0 => QoS::AtMostOnce,
                            1 => QoS::AtLeastOnce,
                            2 => QoS::ExactlyOnce,
                            _ => QoS::AtMostOnce,
                        },
                        publish_data.retain,
                        publish_data.payload
                    ).await {
                        Err(e) => { error!("Error publishing: {}", e); },
                        Ok(_) => { debug!("Published successfully"); }
                    }
                },
            };
        }

        if self.exit_thread == true {
            info!("Thread exit, waiting");
        } else {
            error!("Exited without need to do so ... spookie");
        }
    }
}

pub async fn publish_uptime(mqtt_sender: &Sender<Transmission>) {
    let config = get_config_or_panic!("marstek", ConfigBases::Marstek);
    let uptime_publish = PublishData {
        topic: config.uptime_topic(),
        payload: uptime_seconds().to_string(),
        qos: 1,
        retain: true,
    };
    let _ = mqtt_sender.send(Transmission::Publish(uptime_publish)).await;
}
