use crate::config::MarstekConfig;
use serde::Serialize;

#[derive(Serialize, Clone)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
}

#[derive(Serialize, Clone)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
    pub support_url: String,
}

/// One Home Assistant discovery document per phase topic. Published retained
/// on the discover topic once at startup.
#[derive(Serialize)]
pub struct HaSensor {
    pub name: String,
    pub state_topic: String,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    pub unit_of_measurement: String,
    pub device_class: String,
    pub state_class: String,
    pub unique_id: String,
    pub object_id: String,
    pub dev: HaDevice,
    pub o: HaOrigin,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaSensor {
    pub fn new_power(config: &MarstekConfig, phase: &str) -> Self {
        let safe_phase = phase.to_lowercase();
        let unique_id = format!("m2m_marstek_{}_{}", config.meter_id, safe_phase).to_lowercase();

        return HaSensor {
            discover_topic: format!("homeassistant/sensor/{}/config", unique_id),
            name: format!("{} power {}", config.name, phase),
            state_topic: config.phase_topic(phase),
            availability_topic: config.availability_topic(),
            payload_available: "online".to_string(),
            payload_not_available: "offline".to_string(),
            unit_of_measurement: "W".to_string(),
            device_class: "power".to_string(),
            state_class: "measurement".to_string(),
            unique_id: unique_id.clone(),
            object_id: unique_id,
            dev: HaDevice {
                ids: format!("m2m_marstek_{}", config.meter_id),
                name: config.name.clone(),
                manufacturer: "Marstek".to_string(),
                model: "HME-4".to_string(),
            },
            o: HaOrigin {
                name: "marstek2mqtt".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
                support_url: "https://github.com/marstek2mqtt/marstek2mqtt".to_string(),
            },
        };
    }
}
