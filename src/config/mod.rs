use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_yml;
use std::error::Error;
use std::fs::File;
use std::io::prelude::*;
use std::sync::RwLock;

fn mqtt_client_name_default() -> String { return "marstek2mqtt".to_string() }
fn mqtt_ha_enabled_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

fn marstek_fake_client_id_default() -> String { return "cafecafecafe".to_string() }
fn marstek_read_timeout_ms_default() -> u64 { return 500 }
fn marstek_poll_interval_ms_default() -> u64 { return 300 }
fn marstek_base_topic_default() -> String { return "marstek2mqtt".to_string() }
fn marstek_verbose_default() -> bool { return false }

#[derive(Deserialize, Serialize, Clone)]
pub struct MarstekConfig {
    pub name: String,
    pub meter_ip: String,
    pub meter_id: String,
    /* The meter accepts any client id here, it just has to be present in the frame */
    #[serde(default="marstek_fake_client_id_default")]
    pub fake_client_id: String,
    /* Pre-known checksum suffix (2 lowercase hex chars), skips the brute-force sweep */
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default="marstek_read_timeout_ms_default")]
    pub read_timeout_ms: u64,
    #[serde(default="marstek_poll_interval_ms_default")]
    pub poll_interval_ms: u64,
    #[serde(default="marstek_base_topic_default")]
    pub base_topic: String,
    #[serde(default="marstek_verbose_default")]
    pub verbose: bool,
}

impl MarstekConfig {
    pub fn phase_topic(&self, phase: &str) -> String {
        return format!("{}/{}/{}", self.base_topic, self.meter_id, phase);
    }

    pub fn availability_topic(&self) -> String {
        return format!("{}/{}/availability", self.base_topic, self.meter_id);
    }

    pub fn uptime_topic(&self) -> String {
        return format!("{}/mgt/uptime", self.base_topic);
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub marstek: MarstekConfig,
}

pub struct ConfigHolder {
    pub config: Config,
    pub lock: RwLock<bool>,
}

pub enum ConfigBases {
    Mqtt(MqttConfig),
    Marstek(MarstekConfig),
}

impl ConfigHolder {
    pub fn load() -> Self {
        /* Check for the two paths of the config file */
        let mut file = File::open("config/m2m.yaml");
        if file.is_err() {
            file = Ok(File::open("m2m.yaml").expect("Unable to read the config on config/m2m.yaml or m2m.yaml"));
        }

        let mut file = file.unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("Unable to read config file");
        let c: Config = serde_yml::from_str(&contents).expect("Unable to parse config file");
        return ConfigHolder {
            config: c,
            lock: RwLock::new(true),
        }
    }

    pub fn get_copy(&self, base: &str) -> Result<ConfigBases, Box<dyn Error>> {
        /* Lock against modifications during copy */
        let _lock = self.lock.read().unwrap();

        match base {
            "mqtt" => { return Ok(ConfigBases::Mqtt(self.config.mqtt.clone())) },
            "marstek" => { return Ok(ConfigBases::Marstek(self.config.marstek.clone())) },
            _ => { Err("Type not known")? }
        }
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(ConfigHolder::load());
}

#[macro_export]
macro_rules! get_config_or_panic {
    ($base: expr, $pat: path) => {
        {
            let c = CONFIG.read().unwrap().get_copy($base).unwrap();
            if let $pat(a) = c { // #1
                a
            } else {
                panic!(
                    "mismatch variant when cast to {}",
                    stringify!($pat)); // #2
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
mqtt:
  host: broker.local
  port: 1883
  user: m2m
  pass: secret
marstek:
  name: house
  meter_ip: 192.168.1.50
  meter_id: acd929a73dd4
";
        let c: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(c.mqtt.client_name, "marstek2mqtt");
        assert_eq!(c.mqtt.ha_enabled, true);
        assert_eq!(c.marstek.fake_client_id, "cafecafecafe");
        assert_eq!(c.marstek.checksum, None);
        assert_eq!(c.marstek.read_timeout_ms, 500);
        assert_eq!(c.marstek.poll_interval_ms, 300);
        assert_eq!(c.marstek.verbose, false);
    }

    #[test]
    fn test_topic_helpers() {
        let yaml = r"
mqtt:
  host: broker.local
  port: 1883
  user: m2m
  pass: secret
marstek:
  name: house
  meter_ip: 192.168.1.50
  meter_id: acd929a73dd4
  checksum: '8f'
";
        let c: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(c.marstek.phase_topic("A"), "marstek2mqtt/acd929a73dd4/A");
        assert_eq!(c.marstek.availability_topic(), "marstek2mqtt/acd929a73dd4/availability");
        assert_eq!(c.marstek.uptime_topic(), "marstek2mqtt/mgt/uptime");
        assert_eq!(c.marstek.checksum.as_deref(), Some("8f"));
    }
}
