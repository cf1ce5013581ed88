use crate::config::{ConfigBases, MarstekConfig};
use crate::mqtt::ha_interface::HaSensor;
use crate::mqtt::Transmission;
use crate::{get_config_or_panic, CONFIG};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;

pub mod protocol;
pub mod state;

use protocol::MeterClient;
use state::{MeterState, PollResult};

pub struct MarstekManager {
    sender: Sender<Transmission>,
    config: MarstekConfig,
    ha_enabled: bool,
}

impl MarstekManager {
    pub fn new(sender: Sender<Transmission>) -> Self {
        let config: MarstekConfig = get_config_or_panic!("marstek", ConfigBases::Marstek);
        let mqtt_config = get_config_or_panic!("mqtt", ConfigBases::Mqtt);

        return MarstekManager {
            sender,
            config,
            ha_enabled: mqtt_config.ha_enabled,
        };
    }

    pub async fn start_thread(&mut self) {
        info!("Starting Marstek meter {} at {}", self.config.name, self.config.meter_ip);

        let mut client = MeterClient::new(&self.config);
        match &self.config.checksum {
            Some(suffix) => {
                info!("Using configured checksum {}", suffix);
                client.freeze_checksum(suffix);
            }
            None => {
                /* Blocks until the meter answers once, possibly forever */
                client.discover_checksum().await;
            }
        }

        if self.ha_enabled {
            self.announce_discovery().await;
        }

        let mut meter_state = MeterState::new();
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let poll = match client.send_and_receive().await {
                Ok(reading) => {
                    if self.config.verbose {
                        debug!("Read A: {}, B: {}, C: {}, ALL: {}",
                               reading.phase_a, reading.phase_b, reading.phase_c, reading.total);
                    }
                    PollResult::Reading(reading)
                }
                Err(e) => {
                    warn!("Couldn't read power meter: {}", e);
                    PollResult::NoResponse
                }
            };

            let outcome = meter_state.apply(poll);

            if let Some(availability) = outcome.availability_change {
                info!("Meter {} is now {}", self.config.name, availability.payload());
                let _ = self.sender.send(Transmission::Availability(availability)).await;
            }

            if outcome.publish_reading {
                let _ = self.sender.send(Transmission::Reading(meter_state.reading())).await;
            }

            sleep(interval).await;
        }
    }

    async fn announce_discovery(&self) {
        for phase in ["A", "B", "C", "ALL"] {
            let sensor = HaSensor::new_power(&self.config, phase);
            debug!("Announcing {} on {}", sensor.unique_id, sensor.discover_topic);
            let _ = self.sender.send(Transmission::AutoDiscovery(sensor)).await;
        }
    }
}
