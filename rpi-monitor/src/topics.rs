//! Topic layout of one monitored device
//!
//! ```text
//! {base}/sensor/{slug}/status          availability (online/offline)
//! {base}/sensor/{slug}/monitor         snapshot payload
//! {base}/binary_sensor/{slug}/status
//! {base}/binary_sensor/{slug}/state    pending updates on/off
//! {base}/binary_sensor/{slug}/attributes
//! {base}/command/{slug}/status
//! {base}/command/{slug}/{name}         inbound command
//! {base}/command/{slug}/{name}/attributes
//! {prefix}/{component}/{slug}/{key}/config   discovery
//! ```

use crate::config::{MqttConfig, DEFAULT_DEVICE_NAME};

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Last topic segment reserved for availability under the command namespace
pub const STATUS_SEGMENT: &str = "status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Sensor,
    BinarySensor,
    Command,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Sensor, Category::BinarySensor, Category::Command];

    /// Segment used in state topics
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sensor => "sensor",
            Category::BinarySensor => "binary_sensor",
            Category::Command => "command",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    base: String,
    slug: String,
    discovery_prefix: String,
}

impl TopicLayout {
    pub fn new(mqtt: &MqttConfig, hostname: &str) -> Self {
        Self {
            base: mqtt.base_topic.clone(),
            slug: device_slug(&mqtt.device_name, hostname),
            discovery_prefix: mqtt.discovery_prefix.clone(),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Base of one category namespace, also the `~` of its discovery configs
    pub fn category_base(&self, category: Category) -> String {
        format!("{}/{}/{}", self.base, category.as_str(), self.slug)
    }

    pub fn status(&self, category: Category) -> String {
        format!("{}/{}", self.category_base(category), STATUS_SEGMENT)
    }

    pub fn status_topics(&self) -> Vec<String> {
        Category::ALL.iter().map(|c| self.status(*c)).collect()
    }

    pub fn values(&self) -> String {
        format!("{}/monitor", self.category_base(Category::Sensor))
    }

    pub fn binary_state(&self) -> String {
        format!("{}/state", self.category_base(Category::BinarySensor))
    }

    pub fn binary_attributes(&self) -> String {
        format!("{}/attributes", self.category_base(Category::BinarySensor))
    }

    pub fn command_wildcard(&self) -> String {
        format!("{}/+", self.category_base(Category::Command))
    }

    pub fn command_attributes(&self, name: &str) -> String {
        format!("{}/{}/attributes", self.category_base(Category::Command), name)
    }

    /// Command name carried by `topic`, if it lies directly under the command namespace
    pub fn command_name<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let base = self.category_base(Category::Command);
        let name = topic.strip_prefix(base.as_str())?.strip_prefix('/')?;
        (!name.is_empty() && !name.contains('/')).then_some(name)
    }

    pub fn discovery(&self, component: &str, key: &str) -> String {
        format!("{}/{}/{}/{}/config", self.discovery_prefix, component, self.slug, key)
    }
}

/// `rpi` (the default) becomes `rpi-{hostname}`; anything else is used verbatim
pub fn device_slug(device_name: &str, hostname: &str) -> String {
    if device_name == DEFAULT_DEVICE_NAME {
        format!("{}-{}", DEFAULT_DEVICE_NAME, hostname.to_lowercase())
    } else {
        device_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(device_name: &str) -> TopicLayout {
        let mqtt = MqttConfig {
            device_name: device_name.to_string(),
            ..MqttConfig::default()
        };
        TopicLayout::new(&mqtt, "foo")
    }

    #[test]
    fn test_default_device_name_uses_hostname() {
        let topics = layout("rpi");
        assert_eq!(topics.slug(), "rpi-foo");
        assert_eq!(topics.values(), "home/nodes/sensor/rpi-foo/monitor");
        assert_eq!(topics.command_wildcard(), "home/nodes/command/rpi-foo/+");
        assert_eq!(
            topics.status_topics(),
            vec![
                "home/nodes/sensor/rpi-foo/status",
                "home/nodes/binary_sensor/rpi-foo/status",
                "home/nodes/command/rpi-foo/status",
            ]
        );
    }

    #[test]
    fn test_custom_device_name() {
        let topics = layout("garage");
        assert_eq!(topics.binary_state(), "home/nodes/binary_sensor/garage/state");
        assert_eq!(topics.discovery("sensor", "temperatur"), "homeassistant/sensor/garage/temperatur/config");
    }

    #[test]
    fn test_command_name_extraction() {
        let topics = layout("rpi");
        assert_eq!(topics.command_name("home/nodes/command/rpi-foo/reboot_now"), Some("reboot_now"));
        assert_eq!(topics.command_name("home/nodes/command/rpi-foo/status"), Some("status"));
        assert_eq!(topics.command_name("home/nodes/command/rpi-foo/reboot_now/attributes"), None);
        assert_eq!(topics.command_name("home/nodes/command/rpi-foo/"), None);
        assert_eq!(topics.command_name("home/nodes/command/rpi-bar/reboot_now"), None);
        assert_eq!(topics.command_name("home/nodes/command/rpi-foox/reboot_now"), None);
    }
}
