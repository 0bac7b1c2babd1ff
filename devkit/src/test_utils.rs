/*!
Test harness for rpi-monitor components

Wraps a `MockMqttClient` and adds:
- per-topic message count expectations
- JSON field assertions with dotted paths (`info.Temp_CPU`)
- polling helpers for messages published from background tasks
*/

use crate::mqtt_stub::MockMqttClient;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use anyhow::Result;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            mqtt_client: MockMqttClient::new(),
            expectations: Vec::new(),
        }
    }

    /// Expect exactly `count` messages on `topic` at verification time
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Wait until at least one message shows up on `topic`
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        log::warn!("timeout waiting for message on {}", topic);
        Ok(None)
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic, expectation.expected_count, actual_count
                );
            }
        }
        Ok(())
    }

    /// Assert that every message on `topic` carried the retain flag
    pub fn assert_retained(&self, topic: &str) -> Result<()> {
        let messages = self.mqtt_client.find_messages_by_topic(topic);
        if messages.is_empty() {
            anyhow::bail!("No message published on {}", topic);
        }
        if let Some(msg) = messages.iter().find(|m| !m.retain) {
            anyhow::bail!("Message on {} was not retained: {}", topic, msg.text());
        }
        Ok(())
    }

    pub fn assert_field_exists(&self, topic: &str, field_path: &str) -> Result<()> {
        if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
            if get_nested_field(&msg, field_path).is_some() {
                return Ok(());
            }
        }

        anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic);
    }

    pub fn assert_field_missing(&self, topic: &str, field_path: &str) -> Result<()> {
        match self.mqtt_client.get_last_json_message::<Value>(topic)? {
            Some(msg) if get_nested_field(&msg, field_path).is_some() => {
                anyhow::bail!("Field '{}' unexpectedly present on {}", field_path, topic)
            }
            Some(_) => Ok(()),
            None => anyhow::bail!("No message published on {}", topic),
        }
    }

    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
            if let Some(actual) = get_nested_field(&msg, field_path) {
                if actual == expected {
                    return Ok(());
                }
                anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}",
                             field_path, expected, actual);
            }
        }

        anyhow::bail!("Field '{}' not found for comparison in {}", field_path, topic);
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk a dotted path through nested JSON objects
pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        match current {
            Value::Object(obj) => {
                current = obj.get(part)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}
