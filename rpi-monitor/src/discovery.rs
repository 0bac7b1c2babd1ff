//! Home Assistant MQTT discovery
//!
//! Builds one retained config message per entity so the hub registers every
//! sensor, the update binary sensor and one button per whitelisted command
//! without manual setup. Payloads use the abbreviated discovery keys and a
//! `~` base topic so state topics stay short.
//!
//! All entities share the device identifiers; only the `monitor` entity
//! carries the full device block (manufacturer, model, software version).

use crate::error::ConfigError;
use crate::snapshot::{StaticFacts, PAYLOAD_ENVELOPE};
use crate::topics::{Category, TopicLayout, STATUS_OFFLINE, STATUS_ONLINE};
use crate::transport::Outbox;
use anyhow::{Context, Result};
use rumqttc::QoS;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

pub const MANUFACTURER: &str = "Raspberry Pi (Trading) Ltd.";

pub const MONITOR_KEY: &str = "monitor";
const UPDATE_STATUS_KEY: &str = "os_status";

pub const PAYLOAD_ON: &str = "on";
pub const PAYLOAD_OFF: &str = "off";

/// Identity shared by every entity of this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub unique_id: String,
    pub hostname: String,
    pub model: String,
    pub sw_version: String,
}

impl DeviceIdentity {
    pub fn new(facts: &StaticFacts) -> Self {
        Self {
            unique_id: unique_id(&facts.network.primary_mac),
            hostname: facts.hostname.clone(),
            model: facts.model.clone(),
            sw_version: format!("{} {}", facts.os.release, facts.os.version),
        }
    }
}

/// `b8:27:eb:12:34:56` → `RPi-b827ebMon123456`
///
/// `Mon` sits between the two MAC halves, not after the full address
/// (`RPi-b827eb123456Mon`). Home Assistant keys its entity registry on this
/// value, so changing the layout would orphan every device already announced.
pub fn unique_id(mac: &str) -> String {
    let bare: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let (left, right) = bare.split_at(bare.len().min(6));
    format!("RPi-{}Mon{}", left, right)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    /// Value read from one snapshot field; `attributes` also exposes the whole snapshot
    Sensor { field: &'static str, attributes: bool },
    /// `on`/`off` state with JSON attributes on side topics
    BinarySensor,
    /// Button publishing to `{command base}/{name}`
    Command { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub key: String,
    pub title: String,
    pub kind: EntityKind,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub icon: Option<String>,
    pub object_id: Option<String>,
    /// Attach manufacturer/model/version to this entity's device block
    pub describes_device: bool,
}

impl EntityDescriptor {
    fn new(key: impl Into<String>, title: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            kind,
            unit: None,
            device_class: None,
            icon: None,
            object_id: None,
            describes_device: false,
        }
    }

    pub fn sensor(key: &str, title: impl Into<String>, field: &'static str) -> Self {
        Self::new(key, title, EntityKind::Sensor { field, attributes: false })
    }

    pub fn binary_sensor(key: &str, title: impl Into<String>) -> Self {
        Self::new(key, title, EntityKind::BinarySensor)
    }

    pub fn command(name: &str, hostname: &str) -> Self {
        Self::new(name, name.replace('_', " "), EntityKind::Command { name: name.to_string() })
            .object_id(format!("{}_{}_command", hostname, name))
            .icon(command_icon(name))
    }

    pub fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn device_class(mut self, class: &'static str) -> Self {
        self.device_class = Some(class);
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_attributes(mut self) -> Self {
        if let EntityKind::Sensor { attributes, .. } = &mut self.kind {
            *attributes = true;
        }
        self
    }

    pub fn describing_device(mut self) -> Self {
        self.describes_device = true;
        self
    }

    /// Namespace holding this entity's state topics
    pub fn category(&self) -> Category {
        match self.kind {
            EntityKind::Sensor { .. } => Category::Sensor,
            EntityKind::BinarySensor => Category::BinarySensor,
            EntityKind::Command { .. } => Category::Command,
        }
    }

    /// Hub platform the config is published under
    pub fn component(&self) -> &'static str {
        match self.kind {
            EntityKind::Sensor { .. } => "sensor",
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Command { .. } => "button",
        }
    }
}

fn command_icon(name: &str) -> &'static str {
    if name.contains("reboot") {
        "mdi:restart"
    } else if name.contains("shutdown") {
        "mdi:power"
    } else if name.contains("service") {
        "mdi:cog-counterclockwise"
    } else if name.contains("update") {
        "mdi:update"
    } else {
        "mdi:gesture-tap"
    }
}

/// Fixed sensors followed by one button per whitelisted command
pub fn entity_table(
    facts: &StaticFacts,
    commands: &BTreeMap<String, String>,
) -> Result<Vec<EntityDescriptor>, ConfigError> {
    let host = facts.hostname.as_str();
    let cpu_icon = if facts.cpu.is_32bit_arm() { "mdi:cpu-32-bit" } else { "mdi:cpu-64-bit" };

    let mut entities = vec![
        EntityDescriptor::sensor(MONITOR_KEY, format!("{} Monitor", host), "Timestamp")
            .device_class("timestamp")
            .icon("mdi:raspberry-pi")
            .with_attributes()
            .describing_device(),
        EntityDescriptor::sensor("temperatur", format!("{} CPU Temp", host), "Temp_CPU")
            .device_class("temperature")
            .unit("°C")
            .icon("mdi:thermometer"),
        EntityDescriptor::sensor("cpu_load_1m", format!("{} CPU Load (1 min)", host), "CPU_Load_1min")
            .unit("%")
            .icon(cpu_icon),
        EntityDescriptor::sensor("cpu_load_5m", format!("{} CPU Load (5 min)", host), "CPU_Load_5min")
            .unit("%")
            .icon(cpu_icon),
        EntityDescriptor::sensor("mem_used", format!("{} Memory Usage", host), "Memory_Used")
            .unit("%")
            .icon("mdi:memory"),
        EntityDescriptor::sensor("disk_used", format!("{} Disk Usage", host), "Drive_Size_Used")
            .unit("%")
            .icon("mdi:sd"),
        EntityDescriptor::binary_sensor(UPDATE_STATUS_KEY, format!("{} Operating System", host))
            .device_class("update")
            .icon("mdi:package-up"),
    ];

    let mut seen: HashSet<String> = entities.iter().map(|e| e.key.to_lowercase()).collect();
    for name in commands.keys() {
        if !seen.insert(name.to_lowercase()) {
            return Err(ConfigError::Invalid {
                key: "commands",
                reason: format!("'{}' clashes with a built-in entity", name),
            });
        }
        debug!("- REGISTER command: [{}]", name);
        entities.push(EntityDescriptor::command(name, host));
    }

    Ok(entities)
}

#[derive(Debug, Serialize)]
struct DeviceBlock<'a> {
    identifiers: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacturer: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sw_version: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DiscoveryPayload<'a> {
    name: String,
    uniq_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dev_cla: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat_t: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    val_tpl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    obj_id: Option<&'a str>,
    #[serde(rename = "~")]
    base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd_t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pl_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pl_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attr_t: Option<String>,
    avty_t: &'static str,
    pl_avail: &'static str,
    pl_not_avail: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attr_tpl: Option<String>,
    dev: DeviceBlock<'a>,
}

/// Template extracting one snapshot field
pub fn value_template(field: &str) -> String {
    format!("{{{{ value_json.{}.{} }}}}", PAYLOAD_ENVELOPE, field)
}

pub struct DiscoveryPublisher {
    topics: TopicLayout,
    identity: DeviceIdentity,
    entities: Vec<EntityDescriptor>,
}

impl DiscoveryPublisher {
    pub fn new(topics: TopicLayout, identity: DeviceIdentity, entities: Vec<EntityDescriptor>) -> Self {
        Self {
            topics,
            identity,
            entities,
        }
    }

    pub fn entities(&self) -> &[EntityDescriptor] {
        &self.entities
    }

    fn payload_for<'a>(&'a self, entity: &'a EntityDescriptor) -> DiscoveryPayload<'a> {
        let mut payload = DiscoveryPayload {
            name: title_case(&entity.title),
            uniq_id: format!("{}_{}", self.identity.unique_id, entity.key.to_lowercase()),
            dev_cla: entity.device_class,
            unit_of_measurement: entity.unit,
            stat_t: None,
            val_tpl: None,
            obj_id: entity.object_id.as_deref(),
            base: self.topics.category_base(entity.category()),
            cmd_t: None,
            pl_on: None,
            pl_off: None,
            json_attr_t: None,
            avty_t: "~/status",
            pl_avail: STATUS_ONLINE,
            pl_not_avail: STATUS_OFFLINE,
            ic: entity.icon.as_deref(),
            json_attr_tpl: None,
            dev: DeviceBlock {
                identifiers: [self.identity.unique_id.as_str()],
                manufacturer: None,
                name: None,
                model: None,
                sw_version: None,
            },
        };

        match &entity.kind {
            EntityKind::Sensor { field, attributes } => {
                payload.stat_t = Some("~/monitor");
                payload.val_tpl = Some(value_template(field));
                if *attributes {
                    payload.json_attr_t = Some("~/monitor".to_string());
                    payload.json_attr_tpl = Some(format!("{{{{ value_json.{} | tojson }}}}", PAYLOAD_ENVELOPE));
                }
            }
            EntityKind::BinarySensor => {
                payload.stat_t = Some("~/state");
                payload.pl_on = Some(PAYLOAD_ON);
                payload.pl_off = Some(PAYLOAD_OFF);
                payload.json_attr_t = Some("~/attributes".to_string());
            }
            EntityKind::Command { name } => {
                payload.cmd_t = Some(format!("~/{}", name));
                payload.json_attr_t = Some(format!("~/{}/attributes", name));
            }
        }

        if entity.describes_device {
            payload.dev.manufacturer = Some(MANUFACTURER);
            payload.dev.name = Some(format!("Raspberry Pi {}", title_case(&self.identity.hostname)));
            payload.dev.model = Some(self.identity.model.as_str());
            payload.dev.sw_version = Some(self.identity.sw_version.as_str());
        }

        payload
    }

    /// Discovery topic and body of every entity, in table order
    pub fn render(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.entities
            .iter()
            .map(|entity| {
                let topic = self.topics.discovery(entity.component(), &entity.key);
                let body = serde_json::to_vec(&self.payload_for(entity))
                    .with_context(|| format!("Failed to serialize discovery payload for {}", entity.key))?;
                Ok((topic, body))
            })
            .collect()
    }

    /// Publish every config retained; safe to repeat
    pub async fn announce(&self, outbox: &Outbox) -> Result<usize> {
        info!("Announcing device {} to MQTT broker for auto-discovery ...", self.identity.unique_id);
        let rendered = self.render()?;
        let count = rendered.len();
        for (topic, body) in rendered {
            outbox
                .publish(topic, QoS::AtLeastOnce, true, body)
                .await
                .context("Failed to queue discovery payload")?;
        }
        info!("Queued {} discovery configs", count);
        Ok(count)
    }
}

/// Capitalise the first letter of every word and lowercase the rest;
/// any non-letter starts a new word (`rpi-foo cpu_load` → `Rpi-Foo Cpu_Load`)
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::metrics::fixture::FixedProvider;
    use crate::snapshot::{DeviceSnapshot, DynamicFacts};
    use chrono::Local;
    use rpi_monitor_devkit::test_utils::get_nested_field;
    use rpi_monitor_devkit::MockMqttClient;
    use serde_json::Value;
    use std::time::Duration;

    fn facts() -> StaticFacts {
        StaticFacts::collect(&FixedProvider::new("foo", "b8:27:eb:12:34:56"), "home").unwrap()
    }

    fn commands() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("reboot_now".to_string(), "/sbin/reboot {}".to_string()),
            ("restart_service".to_string(), "systemctl restart {}".to_string()),
        ])
    }

    fn publisher(facts: &StaticFacts) -> DiscoveryPublisher {
        let topics = TopicLayout::new(&MqttConfig::default(), &facts.hostname);
        let entities = entity_table(facts, &commands()).unwrap();
        DiscoveryPublisher::new(topics, DeviceIdentity::new(facts), entities)
    }

    fn rendered_json(publisher: &DiscoveryPublisher) -> BTreeMap<String, Value> {
        publisher
            .render()
            .unwrap()
            .into_iter()
            .map(|(topic, body)| (topic, serde_json::from_slice(&body).unwrap()))
            .collect()
    }

    #[test]
    fn test_unique_id_from_mac() {
        assert_eq!(unique_id("b8:27:eb:12:34:56"), "RPi-b827ebMon123456");
        assert_eq!(unique_id("B8:27:EB:12:34:56"), "RPi-b827ebMon123456");
        assert_ne!(unique_id("b8:27:eb:12:34:56"), "RPi-b827eb123456Mon");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("foo CPU Temp"), "Foo Cpu Temp");
        assert_eq!(title_case("foo CPU Load (1 min)"), "Foo Cpu Load (1 Min)");
        assert_eq!(title_case("reboot now"), "Reboot Now");
        assert_eq!(title_case("rpi-3b"), "Rpi-3B");
    }

    #[test]
    fn test_command_icons() {
        assert_eq!(command_icon("reboot_now"), "mdi:restart");
        assert_eq!(command_icon("shutdown"), "mdi:power");
        assert_eq!(command_icon("restart_service"), "mdi:cog-counterclockwise");
        assert_eq!(command_icon("os_update"), "mdi:update");
        assert_eq!(command_icon("blink"), "mdi:gesture-tap");
    }

    #[test]
    fn test_render_is_deterministic() {
        let facts = facts();
        let first = publisher(&facts).render().unwrap();
        let second = publisher(&facts).render().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 9);
    }

    #[test]
    fn test_unique_ids_distinct() {
        let facts = facts();
        let json = rendered_json(&publisher(&facts));
        let ids: HashSet<&str> = json.values().map(|v| v["uniq_id"].as_str().unwrap()).collect();
        assert_eq!(ids.len(), json.len());
        assert!(ids.contains("RPi-b827ebMon123456_temperatur"));
    }

    #[test]
    fn test_monitor_payload() {
        let facts = facts();
        let json = rendered_json(&publisher(&facts));
        let monitor = &json["homeassistant/sensor/rpi-foo/monitor/config"];

        assert_eq!(monitor["name"], "Foo Monitor");
        assert_eq!(monitor["dev_cla"], "timestamp");
        assert_eq!(monitor["~"], "home/nodes/sensor/rpi-foo");
        assert_eq!(monitor["stat_t"], "~/monitor");
        assert_eq!(monitor["val_tpl"], "{{ value_json.info.Timestamp }}");
        assert_eq!(monitor["json_attr_t"], "~/monitor");
        assert_eq!(monitor["json_attr_tpl"], "{{ value_json.info | tojson }}");
        assert_eq!(monitor["avty_t"], "~/status");
        assert_eq!(monitor["pl_avail"], "online");
        assert_eq!(monitor["pl_not_avail"], "offline");
        assert_eq!(monitor["dev"]["identifiers"][0], "RPi-b827ebMon123456");
        assert_eq!(monitor["dev"]["manufacturer"], MANUFACTURER);
        assert_eq!(monitor["dev"]["name"], "Raspberry Pi Foo");
        assert_eq!(monitor["dev"]["model"], "Raspberry Pi 3B+ r1.3");

        let temperature = &json["homeassistant/sensor/rpi-foo/temperatur/config"];
        assert_eq!(temperature["unit_of_measurement"], "°C");
        assert!(temperature.get("json_attr_t").is_none());
        assert!(temperature["dev"].get("manufacturer").is_none());
        assert_eq!(json["homeassistant/sensor/rpi-foo/cpu_load_1m/config"]["ic"], "mdi:cpu-32-bit");
    }

    #[test]
    fn test_binary_sensor_and_button_payloads() {
        let facts = facts();
        let json = rendered_json(&publisher(&facts));

        let update = &json["homeassistant/binary_sensor/rpi-foo/os_status/config"];
        assert_eq!(update["~"], "home/nodes/binary_sensor/rpi-foo");
        assert_eq!(update["stat_t"], "~/state");
        assert_eq!(update["pl_on"], "on");
        assert_eq!(update["json_attr_t"], "~/attributes");
        assert!(update.get("val_tpl").is_none());

        let reboot = &json["homeassistant/button/rpi-foo/reboot_now/config"];
        assert_eq!(reboot["name"], "Reboot Now");
        assert_eq!(reboot["obj_id"], "foo_reboot_now_command");
        assert_eq!(reboot["~"], "home/nodes/command/rpi-foo");
        assert_eq!(reboot["cmd_t"], "~/reboot_now");
        assert_eq!(reboot["json_attr_t"], "~/reboot_now/attributes");
        assert_eq!(reboot["ic"], "mdi:restart");
        assert!(reboot.get("stat_t").is_none());
    }

    #[test]
    fn test_value_templates_resolve_against_snapshot() {
        let provider = FixedProvider::new("foo", "b8:27:eb:12:34:56");
        let facts = StaticFacts::collect(&provider, "home").unwrap();
        let snapshot = DeviceSnapshot::build(&facts, DynamicFacts::gather(&provider), 0, 3, Local::now());
        let wire: Value = serde_json::from_slice(&snapshot.to_payload().unwrap()).unwrap();
        let direct = serde_json::to_value(&snapshot).unwrap();

        for entity in publisher(&facts).entities() {
            if let EntityKind::Sensor { field, .. } = entity.kind {
                let template = value_template(field);
                let path = template
                    .trim_start_matches("{{ value_json.")
                    .trim_end_matches(" }}");
                let extracted = get_nested_field(&wire, path).unwrap();
                assert_eq!(extracted, &direct[field], "field {}", field);
            }
        }
    }

    #[test]
    fn test_command_clashing_with_sensor_rejected() {
        let facts = facts();
        let commands = BTreeMap::from([("monitor".to_string(), "echo {}".to_string())]);
        assert!(matches!(
            entity_table(&facts, &commands),
            Err(ConfigError::Invalid { key: "commands", .. })
        ));
    }

    #[tokio::test]
    async fn test_announce_publishes_retained() {
        let facts = facts();
        let mock = MockMqttClient::new();
        let (outbox, _worker) = Outbox::spawn(mock.clone(), Duration::ZERO);

        let count = publisher(&facts).announce(&outbox).await.unwrap();
        outbox.flush().await.unwrap();

        let configs = mock.find_messages_by_prefix("homeassistant/");
        assert_eq!(configs.len(), count);
        assert!(configs.iter().all(|m| m.retain && m.qos == QoS::AtLeastOnce));
    }
}
